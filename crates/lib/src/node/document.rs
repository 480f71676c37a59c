//! Mutable runtime state attached to a node.
//!
//! The document is owned exclusively by the lifecycle engine while an
//! operation is dispatched: global state, the append-only history ledger,
//! the tracked-file cache and cheap derived values.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tracker::CacheEntry;

/// Global lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  /// No operation has run yet.
  Unset,
  /// An operation started; for terminal operations this also covers the
  /// window between submission and a successful probe.
  Started,
  /// A second dispatch observed `started` and flipped here; treated as
  /// busy by eligibility checks.
  TmpLock,
  /// The node's operation finished; children may materialize.
  Ready,
  Failure,
  /// A terminal run's log ends without a completion or error marker.
  Incomplete,
  /// A terminal run's log ends with a completion marker.
  Completed,
}

impl NodeState {
  pub fn as_str(&self) -> &'static str {
    match self {
      NodeState::Unset => "unset",
      NodeState::Started => "started",
      NodeState::TmpLock => "tmp_lock",
      NodeState::Ready => "ready",
      NodeState::Failure => "failure",
      NodeState::Incomplete => "incomplete",
      NodeState::Completed => "completed",
    }
  }
}

impl std::fmt::Display for NodeState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Classification of an executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
  /// An external command (shell or argv).
  Shell,
  /// An internal file-mutation function.
  Internal,
}

/// Outcome recorded for an executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
  /// Handed off for out-of-process execution; completion unknown.
  Started,
  Success,
  Failure,
}

/// Where a step's captured output lives.
///
/// Output below the inline threshold is stored directly in the ledger;
/// anything larger is written to a log file and referenced by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRef {
  Inline(String),
  File(PathBuf),
}

/// One record in the append-only history ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
  /// What was executed, as a human-readable command line or step name.
  pub command: String,
  pub step_type: StepType,
  pub log: LogRef,
  pub state: StepOutcome,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub flags: Vec<String>,
}

/// Mutable per-node runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub state: NodeState,
  /// Append-only ledger of executed steps.
  pub history: Vec<HistoryEntry>,
  /// Relative file path → cached content hash and mtime.
  pub cache: BTreeMap<String, CacheEntry>,
  /// Cheap derived scalars (cell counts and the like).
  pub derived: BTreeMap<String, Value>,
  /// True once parent→child materialization has completed.
  pub init_dependent: bool,
}

impl Default for Document {
  fn default() -> Self {
    Self::new()
  }
}

impl Document {
  pub fn new() -> Self {
    Self {
      state: NodeState::Unset,
      history: Vec::new(),
      cache: BTreeMap::new(),
      derived: BTreeMap::new(),
      init_dependent: false,
    }
  }

  pub fn record(&mut self, entry: HistoryEntry) {
    self.history.push(entry);
  }

  pub fn last_entry(&self) -> Option<&HistoryEntry> {
    self.history.last()
  }

  /// True if a step with this command already succeeded.
  ///
  /// Used by the engine to avoid duplicate side effects when an operation
  /// is re-dispatched after a partial failure.
  pub fn step_succeeded(&self, command: &str) -> bool {
    self
      .history
      .iter()
      .any(|e| e.command == command && e.state == StepOutcome::Success)
  }
}
