//! Filesystem-backed node persistence.
//!
//! # Storage Layout
//!
//! ```text
//! workspace/
//! ├── nodes/<id>/
//! │   ├── statepoint.json   (written once, never mutated)
//! │   ├── document.json     (atomic rewrite on every change)
//! │   ├── case/             (the variant's working directory)
//! │   └── logs/             (spilled step output)
//! ├── view/                 (human-browsable symlink tree)
//! └── view-index.json       (id → view path, written by expansion)
//! ```
//!
//! The store handle is passed explicitly into every component constructor;
//! there is no process-wide project singleton.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::consts::{
  CASE_DIRNAME, DOCUMENT_FILENAME, LOGS_DIRNAME, NODES_DIRNAME, STATEPOINT_FILENAME, VIEW_INDEX_FILENAME,
  WORKSPACE_ENV,
};
use crate::node::{Document, Identifiable, Node, NodeId, Statepoint};

/// Errors from node persistence.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to create directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to compute node id: {0}")]
  Id(#[source] serde_json::Error),

  #[error("statepoint on disk does not match statepoint for node {id}")]
  StatepointMismatch { id: NodeId },

  #[error("unknown node {id}")]
  UnknownNode { id: NodeId },

  #[error("{path} is not a casegrid workspace (missing root node; run init first)")]
  NotAWorkspace { path: PathBuf },
}

/// Handle to one workspace's node tree.
#[derive(Debug, Clone)]
pub struct NodeStore {
  root: PathBuf,
}

impl NodeStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Workspace root from the environment, falling back to the current
  /// directory.
  pub fn default_root() -> PathBuf {
    std::env::var_os(WORKSPACE_ENV)
      .map(PathBuf::from)
      .unwrap_or_else(|| PathBuf::from("."))
  }

  /// Create the workspace skeleton (idempotent).
  pub fn init(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let store = Self::new(root);
    let nodes = store.nodes_dir();
    fs::create_dir_all(&nodes).map_err(|e| StoreError::CreateDir {
      path: nodes.clone(),
      source: e,
    })?;
    Ok(store)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn nodes_dir(&self) -> PathBuf {
    self.root.join(NODES_DIRNAME)
  }

  pub fn node_dir(&self, id: &NodeId) -> PathBuf {
    self.nodes_dir().join(&id.0)
  }

  pub fn case_dir(&self, id: &NodeId) -> PathBuf {
    self.node_dir(id).join(CASE_DIRNAME)
  }

  pub fn logs_dir(&self, id: &NodeId) -> PathBuf {
    self.node_dir(id).join(LOGS_DIRNAME)
  }

  /// Open a node by statepoint, materializing its on-disk identity if absent.
  ///
  /// Re-opening an existing node verifies that the stored statepoint still
  /// matches, so a drifted spec cannot silently reuse another node's
  /// directory.
  pub fn open(&self, statepoint: Statepoint) -> Result<Node, StoreError> {
    let id = statepoint.compute_id().map_err(StoreError::Id)?;
    let statepoint_path = self.node_dir(&id).join(STATEPOINT_FILENAME);

    if statepoint_path.exists() {
      let existing: Statepoint = read_json(&statepoint_path)?;
      if existing != statepoint {
        return Err(StoreError::StatepointMismatch { id });
      }
      let document = self.load_document(&id)?;
      return Ok(Node {
        id,
        statepoint,
        document,
      });
    }

    for dir in [self.node_dir(&id), self.case_dir(&id), self.logs_dir(&id)] {
      fs::create_dir_all(&dir).map_err(|e| StoreError::CreateDir { path: dir.clone(), source: e })?;
    }

    write_json_atomic(&statepoint_path, &statepoint)?;
    let document = Document::new();
    self.save_document(&id, &document)?;

    debug!(id = %id, operation = %statepoint.operation, "node created");
    Ok(Node {
      id,
      statepoint,
      document,
    })
  }

  /// Load a node by id.
  pub fn get(&self, id: &NodeId) -> Result<Node, StoreError> {
    let statepoint_path = self.node_dir(id).join(STATEPOINT_FILENAME);
    if !statepoint_path.exists() {
      return Err(StoreError::UnknownNode { id: id.clone() });
    }
    let statepoint: Statepoint = read_json(&statepoint_path)?;
    let document = self.load_document(id)?;
    Ok(Node {
      id: id.clone(),
      statepoint,
      document,
    })
  }

  /// The workspace's root node (the base case). Errors if init never ran.
  pub fn root_node(&self) -> Result<Node, StoreError> {
    let statepoint = Statepoint::root();
    let id = statepoint.compute_id().map_err(StoreError::Id)?;
    if !self.node_dir(&id).join(STATEPOINT_FILENAME).exists() {
      return Err(StoreError::NotAWorkspace {
        path: self.root.clone(),
      });
    }
    self.get(&id)
  }

  pub fn load_document(&self, id: &NodeId) -> Result<Document, StoreError> {
    read_json(&self.node_dir(id).join(DOCUMENT_FILENAME))
  }

  /// Persist a node's document atomically (temp file + rename).
  pub fn save_document(&self, id: &NodeId, document: &Document) -> Result<(), StoreError> {
    write_json_atomic(&self.node_dir(id).join(DOCUMENT_FILENAME), document)
  }

  /// Enumerate every node in the workspace, sorted by id.
  pub fn all_nodes(&self) -> Result<Vec<Node>, StoreError> {
    let nodes_dir = self.nodes_dir();
    let entries = match fs::read_dir(&nodes_dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => {
        return Err(StoreError::Read {
          path: nodes_dir,
          source: e,
        });
      }
    };

    let mut ids = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| StoreError::Read {
        path: nodes_dir.clone(),
        source: e,
      })?;
      if entry.path().join(STATEPOINT_FILENAME).exists()
        && let Some(name) = entry.file_name().to_str()
      {
        ids.push(NodeId(name.to_string()));
      }
    }
    ids.sort();

    ids.iter().map(|id| self.get(id)).collect()
  }

  /// Persist the id → view-path mapping produced by expansion.
  pub fn save_view_index(&self, mapping: &BTreeMap<NodeId, PathBuf>) -> Result<(), StoreError> {
    write_json_atomic(&self.root.join(VIEW_INDEX_FILENAME), mapping)
  }

  /// Load the id → view-path mapping; empty if expansion never ran.
  pub fn load_view_index(&self) -> Result<BTreeMap<NodeId, PathBuf>, StoreError> {
    let path = self.root.join(VIEW_INDEX_FILENAME);
    if !path.exists() {
      return Ok(BTreeMap::new());
    }
    read_json(&path)
  }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
  let content = fs::read_to_string(path).map_err(|e| StoreError::Read {
    path: path.to_path_buf(),
    source: e,
  })?;
  serde_json::from_str(&content).map_err(|e| StoreError::Parse {
    path: path.to_path_buf(),
    source: e,
  })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
  let content = serde_json::to_string_pretty(value).map_err(StoreError::Serialize)?;
  let temp_path = path.with_extension("json.tmp");
  fs::write(&temp_path, &content).map_err(|e| StoreError::Write {
    path: temp_path.clone(),
    source: e,
  })?;
  fs::rename(&temp_path, path).map_err(|e| StoreError::Write {
    path: path.to_path_buf(),
    source: e,
  })
}
