//! Workspace-wide constants.

/// Number of hex characters kept from a statepoint's SHA-256 for node ids.
pub const NODE_ID_PREFIX_LEN: usize = 20;

/// Step output at or below this many characters is stored inline in the
/// history ledger; anything larger is spilled to a log file.
pub const INLINE_LOG_MAX: usize = 1000;

/// Number of bytes read from the end of a solver log when probing.
pub const LOG_TAIL_BYTES: u64 = 4096;

pub const NODES_DIRNAME: &str = "nodes";
pub const CASE_DIRNAME: &str = "case";
pub const LOGS_DIRNAME: &str = "logs";
pub const VIEW_DIRNAME: &str = "view";
pub const STATEPOINT_FILENAME: &str = "statepoint.json";
pub const DOCUMENT_FILENAME: &str = "document.json";
pub const VIEW_INDEX_FILENAME: &str = "view-index.json";

/// File that must exist below a case directory before any operation may run.
pub const DEFAULT_REQUIRED_FILE: &str = "system/controlDict";

/// Environment variable overriding the workspace root.
pub const WORKSPACE_ENV: &str = "CASEGRID_WORKSPACE";

/// Separator used when flattening nested parameter keys for schema templates.
pub const FLATTEN_SEPARATOR: char = '/';
