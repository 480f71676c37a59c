//! Human-browsable symlink view of the variant tree.
//!
//! Expansion records an id → path mapping for leaf nodes; the exporter turns
//! it into a secondary directory tree of symlinks, e.g.
//! `view/cells_8/solver_A → nodes/<id>/case`. The view is derived data and
//! rebuilt from scratch on every export.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::consts::VIEW_DIRNAME;
use crate::node::NodeId;
use crate::store::NodeStore;

#[derive(Debug, Error)]
pub enum ViewError {
  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err(path: &Path, source: io::Error) -> ViewError {
  ViewError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Rebuild the symlink view from an id → path mapping.
///
/// Returns the number of links created. Stale links from earlier exports
/// are removed first, so the export is idempotent.
pub fn export_view(store: &NodeStore, mapping: &BTreeMap<NodeId, PathBuf>) -> Result<usize, ViewError> {
  let view_dir = store.root().join(VIEW_DIRNAME);

  if view_dir.exists() {
    fs::remove_dir_all(&view_dir).map_err(|e| io_err(&view_dir, e))?;
  }
  fs::create_dir_all(&view_dir).map_err(|e| io_err(&view_dir, e))?;

  for (id, rel_path) in mapping {
    let link = view_dir.join(rel_path);
    if let Some(parent) = link.parent() {
      fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let target = store.case_dir(id);
    link_dir(&target, &link)?;
    debug!(id = %id, link = %link.display(), "view link created");
  }

  info!(links = mapping.len(), view = %view_dir.display(), "view exported");
  Ok(mapping.len())
}

#[cfg(unix)]
fn link_dir(target: &Path, link: &Path) -> Result<(), ViewError> {
  std::os::unix::fs::symlink(target, link).map_err(|e| io_err(link, e))
}

#[cfg(windows)]
fn link_dir(target: &Path, link: &Path) -> Result<(), ViewError> {
  std::os::windows::fs::symlink_dir(target, link).map_err(|e| io_err(link, e))
}
