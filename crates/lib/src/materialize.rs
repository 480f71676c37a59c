//! Parent → child case materialization.
//!
//! A child's case directory is populated from its parent without duplicating
//! unmodified data: directories are recreated for real, files are symlinked.
//! Before any step may modify a shared file it must call [`break_link`],
//! which replaces the symlink with a private copy so siblings sharing the
//! same parent are never corrupted by one child's edit.
//!
//! The free-form `shell` operation gets a full copy instead of links, since
//! its side effects on the tree cannot be predicted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::node::{Node, NodeId, NodeState};
use crate::store::{NodeStore, StoreError};

/// Errors from materialization. All of them leave the node un-initialized
/// and are retryable on the next engine invocation.
#[derive(Debug, Error)]
pub enum MaterializeError {
  #[error("parent case directory {path} is missing or not walkable")]
  ParentMissing { path: PathBuf },

  #[error("parent {id} is not ready (state {state})")]
  ParentNotReady { id: NodeId, state: NodeState },

  #[error("failed to walk parent tree: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}

fn io_err(path: &Path, source: io::Error) -> MaterializeError {
  MaterializeError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// How a child's files are produced from the parent's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
  /// Symlink every file (default).
  Link,
  /// Copy every file; used for operations whose steps may mutate shared
  /// content in place.
  Copy,
}

impl LinkPolicy {
  pub fn for_operation(operation: &str) -> Self {
    if operation == "shell" {
      LinkPolicy::Copy
    } else {
      LinkPolicy::Link
    }
  }
}

/// Populates child case directories from their parents.
#[derive(Debug, Clone)]
pub struct Materializer {
  store: NodeStore,
}

impl Materializer {
  pub fn new(store: NodeStore) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &NodeStore {
    &self.store
  }

  /// Materialize a node's case directory from its parent.
  ///
  /// Runs at most once per node: an already-initialized node returns
  /// `Ok(false)` without touching the filesystem, which makes repeated
  /// engine invocations against the same node crash-resume safe.
  pub fn materialize(&self, node: &mut Node) -> Result<bool, MaterializeError> {
    if node.document.init_dependent {
      debug!(id = %node.id, "already materialized, skipping");
      return Ok(false);
    }

    let Some(parent_id) = node.statepoint.parent_id.clone() else {
      // The root node's case payload is placed at workspace init; there is
      // nothing to link.
      node.document.init_dependent = true;
      self.store.save_document(&node.id, &node.document)?;
      return Ok(true);
    };

    let parent = self.store.get(&parent_id)?;
    if parent.document.state != NodeState::Ready {
      return Err(MaterializeError::ParentNotReady {
        id: parent_id,
        state: parent.document.state,
      });
    }

    let parent_case = self.store.case_dir(&parent_id);
    if !parent_case.is_dir() {
      return Err(MaterializeError::ParentMissing { path: parent_case });
    }

    let child_case = self.store.case_dir(&node.id);
    let policy = LinkPolicy::for_operation(&node.statepoint.operation);
    debug!(id = %node.id, parent = %parent_id, ?policy, "materializing case directory");

    populate(&parent_case, &child_case, policy)?;

    node.document.init_dependent = true;
    self.store.save_document(&node.id, &node.document)?;
    Ok(true)
  }
}

/// Walk the parent tree, recreating directories and linking/copying files.
fn populate(parent_case: &Path, child_case: &Path, policy: LinkPolicy) -> Result<(), MaterializeError> {
  fs::create_dir_all(child_case).map_err(|e| io_err(child_case, e))?;

  for entry in walkdir::WalkDir::new(parent_case).min_depth(1).sort_by_file_name() {
    let entry = entry?;
    let rel = entry
      .path()
      .strip_prefix(parent_case)
      .expect("walkdir yields children of its root");
    let target = child_case.join(rel);

    if entry.file_type().is_dir() {
      fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
      continue;
    }

    // A partial earlier run may have left a file or link behind.
    if fs::symlink_metadata(&target).is_ok() {
      fs::remove_file(&target).map_err(|e| io_err(&target, e))?;
    }

    match policy {
      LinkPolicy::Link => link_file(entry.path(), &target)?,
      LinkPolicy::Copy => {
        // fs::copy follows symlinks, so a linked parent file becomes a
        // real private copy here.
        fs::copy(entry.path(), &target).map_err(|e| io_err(&target, e))?;
      }
    }
  }

  Ok(())
}

#[cfg(unix)]
fn link_file(source: &Path, target: &Path) -> Result<(), MaterializeError> {
  std::os::unix::fs::symlink(source, target).map_err(|e| io_err(target, e))
}

#[cfg(windows)]
fn link_file(source: &Path, target: &Path) -> Result<(), MaterializeError> {
  std::os::windows::fs::symlink_file(source, target).map_err(|e| io_err(target, e))
}

/// Copy-on-write break: replace a symlink with a private copy of its target.
///
/// A regular file (or a missing path) is a no-op, so breaking is idempotent
/// and safe to call unconditionally before a mutation.
pub fn break_link(path: &Path) -> Result<bool, MaterializeError> {
  let metadata = match fs::symlink_metadata(path) {
    Ok(metadata) => metadata,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
    Err(e) => return Err(io_err(path, e)),
  };

  if !metadata.file_type().is_symlink() {
    return Ok(false);
  }

  // Resolve through link chains to the real content before unlinking.
  let target = fs::canonicalize(path).map_err(|e| io_err(path, e))?;
  fs::remove_file(path).map_err(|e| io_err(path, e))?;

  if target.is_dir() {
    copy_dir_recursive(&target, path)?;
  } else {
    fs::copy(&target, path).map_err(|e| io_err(path, e))?;
  }

  debug!(path = %path.display(), "broke symlink into private copy");
  Ok(true)
}

/// Recursively copy a directory tree, following symlinks.
pub fn copy_dir_recursive(source: &Path, target: &Path) -> Result<(), MaterializeError> {
  fs::create_dir_all(target).map_err(|e| io_err(target, e))?;

  for entry in walkdir::WalkDir::new(source).min_depth(1).sort_by_file_name() {
    let entry = entry?;
    let rel = entry
      .path()
      .strip_prefix(source)
      .expect("walkdir yields children of its root");
    let dest = target.join(rel);

    if entry.file_type().is_dir() {
      fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))?;
    } else {
      fs::copy(entry.path(), &dest).map_err(|e| io_err(&dest, e))?;
    }
  }

  Ok(())
}

/// Materialize independent sibling nodes on a bounded worker pool.
///
/// Siblings are safe to run concurrently because each writes only to its own
/// subtree. Failures are node-local: each id gets its own result and a
/// failed sibling never aborts the rest.
pub async fn materialize_siblings(
  materializer: &Materializer,
  ids: Vec<NodeId>,
  parallelism: usize,
) -> Vec<(NodeId, Result<bool, MaterializeError>)> {
  let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
  let mut join_set = JoinSet::new();

  for id in ids {
    let materializer = materializer.clone();
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      let _permit = semaphore.acquire_owned().await.unwrap();
      let task_id = id.clone();
      let result = tokio::task::spawn_blocking(move || {
        let mut node = materializer.store().get(&task_id)?;
        materializer.materialize(&mut node)
      })
      .await
      .unwrap_or_else(|e| {
        Err(MaterializeError::Io {
          path: PathBuf::new(),
          source: io::Error::other(e.to_string()),
        })
      });
      (id, result)
    });
  }

  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(pair) => results.push(pair),
      Err(e) => warn!(error = %e, "materialization task panicked"),
    }
  }
  results
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::Statepoint;
  use serde_json::json;
  use tempfile::TempDir;

  fn setup_parent(store: &NodeStore) -> Node {
    let mut root = store.open(Statepoint::root()).unwrap();
    let case = store.case_dir(&root.id);
    fs::create_dir_all(case.join("system")).unwrap();
    fs::write(case.join("system/controlDict"), "deltaT 0.1;").unwrap();
    fs::write(case.join("U"), "uniform (0 0 0)").unwrap();

    root.document.state = NodeState::Ready;
    root.document.init_dependent = true;
    store.save_document(&root.id, &root.document).unwrap();
    root
  }

  fn child_of(store: &NodeStore, parent: &Node, operation: &str) -> Node {
    let mut sp = Statepoint::root();
    sp.parent_id = Some(parent.id.clone());
    sp.has_child = false;
    sp.operation = operation.to_string();
    sp.params.insert("cells".to_string(), json!(8));
    sp.keys.push("cells".to_string());
    store.open(sp).unwrap()
  }

  #[test]
  fn link_policy_copies_only_for_shell() {
    assert_eq!(LinkPolicy::for_operation("blockMesh"), LinkPolicy::Link);
    assert_eq!(LinkPolicy::for_operation("shell"), LinkPolicy::Copy);
  }

  #[test]
  fn materialize_links_parent_files() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let parent = setup_parent(&store);
    let mut child = child_of(&store, &parent, "blockMesh");

    let materializer = Materializer::new(store.clone());
    assert!(materializer.materialize(&mut child).unwrap());

    let child_case = store.case_dir(&child.id);
    let linked = child_case.join("system/controlDict");
    assert!(linked.exists());
    assert!(fs::symlink_metadata(&linked).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_to_string(&linked).unwrap(), "deltaT 0.1;");
    assert!(child.document.init_dependent);
  }

  #[test]
  fn materialize_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let parent = setup_parent(&store);
    let mut child = child_of(&store, &parent, "blockMesh");

    let materializer = Materializer::new(store.clone());
    assert!(materializer.materialize(&mut child).unwrap());

    // A second invocation must not touch the filesystem again.
    fs::remove_dir_all(store.case_dir(&parent.id)).unwrap();
    assert!(!materializer.materialize(&mut child).unwrap());
  }

  #[test]
  fn shell_operation_gets_real_copies() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let parent = setup_parent(&store);
    let mut child = child_of(&store, &parent, "shell");

    let materializer = Materializer::new(store.clone());
    materializer.materialize(&mut child).unwrap();

    let copied = store.case_dir(&child.id).join("U");
    assert!(!fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_to_string(&copied).unwrap(), "uniform (0 0 0)");
  }

  #[test]
  fn materialize_requires_ready_parent() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let mut root = store.open(Statepoint::root()).unwrap();
    root.document.init_dependent = true;
    store.save_document(&root.id, &root.document).unwrap();

    let root = store.get(&root.id).unwrap();
    let mut child = child_of(&store, &root, "blockMesh");

    let materializer = Materializer::new(store.clone());
    let err = materializer.materialize(&mut child).unwrap_err();
    assert!(matches!(err, MaterializeError::ParentNotReady { .. }));
    assert!(!child.document.init_dependent);
  }

  #[test]
  fn materialize_fails_on_missing_parent_tree() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let parent = setup_parent(&store);
    let mut child = child_of(&store, &parent, "blockMesh");

    fs::remove_dir_all(store.case_dir(&parent.id)).unwrap();

    let materializer = Materializer::new(store.clone());
    let err = materializer.materialize(&mut child).unwrap_err();
    assert!(matches!(err, MaterializeError::ParentMissing { .. }));

    // Node is left un-initialized, so a later invocation retries.
    let reloaded = store.get(&child.id).unwrap();
    assert!(!reloaded.document.init_dependent);
  }

  #[test]
  fn break_link_replaces_symlink_with_copy() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let parent = setup_parent(&store);
    let mut child = child_of(&store, &parent, "blockMesh");

    let materializer = Materializer::new(store.clone());
    materializer.materialize(&mut child).unwrap();

    let linked = store.case_dir(&child.id).join("system/controlDict");
    assert!(break_link(&linked).unwrap());
    assert!(!fs::symlink_metadata(&linked).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_to_string(&linked).unwrap(), "deltaT 0.1;");

    // The child's private copy must not leak back into the parent.
    fs::write(&linked, "deltaT 0.5;").unwrap();
    let parent_file = store.case_dir(&parent.id).join("system/controlDict");
    assert_eq!(fs::read_to_string(&parent_file).unwrap(), "deltaT 0.1;");
  }

  #[test]
  fn break_link_on_regular_file_is_noop() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("plain.txt");
    fs::write(&path, "content").unwrap();

    assert!(!break_link(&path).unwrap());
    assert_eq!(fs::read_to_string(&path).unwrap(), "content");
  }

  #[test]
  fn break_link_on_missing_path_is_noop() {
    let temp = TempDir::new().unwrap();
    assert!(!break_link(&temp.path().join("missing")).unwrap());
  }

  #[tokio::test]
  async fn siblings_materialize_concurrently() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let parent = setup_parent(&store);

    let mut ids = Vec::new();
    for cells in [8, 16, 32, 64] {
      let mut sp = Statepoint::root();
      sp.parent_id = Some(parent.id.clone());
      sp.has_child = false;
      sp.operation = "blockMesh".to_string();
      sp.params.insert("cells".to_string(), json!(cells));
      sp.keys.push("cells".to_string());
      ids.push(store.open(sp).unwrap().id);
    }

    let materializer = Materializer::new(store.clone());
    let results = materialize_siblings(&materializer, ids.clone(), 2).await;

    assert_eq!(results.len(), 4);
    for (id, result) in results {
      assert!(result.unwrap(), "node {id} should have materialized");
      assert!(store.get(&id).unwrap().document.init_dependent);
    }
  }
}
