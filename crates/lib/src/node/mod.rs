//! Node identity: statepoints and stable ids.
//!
//! A node is one point in the variant tree. Its statepoint is the immutable
//! parameter set that defines its identity; the id is a truncated SHA-256 of
//! the JSON-serialized statepoint, so an unchanged specification always
//! re-derives the same ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::consts::NODE_ID_PREFIX_LEN;
use crate::spec::BuildStep;

pub mod document;
pub use document::{Document, HistoryEntry, LogRef, NodeState, StepOutcome, StepType};

pub type IdError = serde_json::Error;

/// Stable identifier of a node, derived from its statepoint.
///
/// A 20-character truncated lowercase-hex SHA-256. Truncation keeps node
/// directory names readable while remaining collision resistant at sweep
/// scale.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Anything that derives a stable id from its serialized form.
pub trait Identifiable: Serialize {
  fn compute_id(&self) -> Result<NodeId, IdError> {
    let serialized = serde_json::to_string(self)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    Ok(NodeId(full[..NODE_ID_PREFIX_LEN].to_string()))
  }
}

/// Immutable identity-defining parameter set of a node.
///
/// Never mutated after creation; only the document changes over a node's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statepoint {
  /// Parameters introduced at this level of the tree.
  pub params: BTreeMap<String, Value>,

  /// Which parameter names are new at this level.
  pub keys: Vec<String>,

  pub parent_id: Option<NodeId>,

  /// True if further variation levels exist below this node. Such nodes
  /// are never eligible for terminal execution operations.
  pub has_child: bool,

  /// Name of the operation this node instantiates.
  pub operation: String,

  #[serde(default)]
  pub pre_build: Vec<BuildStep>,

  #[serde(default)]
  pub post_build: Vec<BuildStep>,

  /// Snapshot of the parent's effective parameters, so descendants resolve
  /// inherited values without walking the tree.
  #[serde(default)]
  pub parent: BTreeMap<String, Value>,
}

impl Identifiable for Statepoint {}

impl Statepoint {
  /// The statepoint of the workspace root node holding the base case.
  pub fn root() -> Self {
    Self {
      params: BTreeMap::new(),
      keys: Vec::new(),
      parent_id: None,
      has_child: true,
      operation: "base".to_string(),
      pre_build: Vec::new(),
      post_build: Vec::new(),
      parent: BTreeMap::new(),
    }
  }

  /// Own parameters merged over the inherited parent snapshot.
  pub fn effective_params(&self) -> BTreeMap<String, Value> {
    let mut all = self.parent.clone();
    for (k, v) in &self.params {
      all.insert(k.clone(), v.clone());
    }
    all
  }
}

/// A point in the variant tree: identity plus mutable runtime document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id: NodeId,
  pub statepoint: Statepoint,
  pub document: Document,
}

impl Node {
  /// Leaf nodes are the only ones eligible for terminal execution.
  pub fn is_leaf(&self) -> bool {
    !self.statepoint.has_child
  }
}
