//! Content-hash change detection for case configuration files.
//!
//! Every configuration file an operation reads or writes is tracked in the
//! node document's cache as `(content hash, modification time)`. On later
//! invocations the tracker compares the modification time first and only
//! rehashes when it differs, so unchanged trees are cheap to re-check while
//! content equality still wins over a deliberately reset timestamp.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// A full 64-character SHA256 hash of a file's contents.
///
/// Used for equality detection only, not for security.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Cached hash and modification time for one tracked file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub hash: ContentHash,
  pub mtime: DateTime<Utc>,
}

/// Errors from hashing or stat-ing tracked files.
#[derive(Debug, Error)]
pub enum TrackerError {
  #[error("failed to read file {path}: {source}")]
  ReadFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to stat file {path}: {source}")]
  Stat {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA256 hash.
pub fn hash_file(path: &Path) -> Result<ContentHash, TrackerError> {
  let mut file = fs::File::open(path).map_err(|e| TrackerError::ReadFile {
    path: path.to_path_buf(),
    source: e,
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| TrackerError::ReadFile {
      path: path.to_path_buf(),
      source: e,
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Compute a fresh cache entry for a file: content hash plus modification time.
pub fn compute(path: &Path) -> Result<CacheEntry, TrackerError> {
  let hash = hash_file(path)?;
  let mtime = file_mtime(path)?;
  Ok(CacheEntry { hash, mtime })
}

/// Check whether a file drifted from its cached entry.
///
/// Fast path: an unchanged modification time means unmodified. When the
/// modification time differs the content is rehashed, so a rewrite with
/// identical content (or a reset timestamp over changed content) is still
/// classified correctly. A missing file counts as modified.
pub fn is_modified(path: &Path, cached: &CacheEntry) -> Result<bool, TrackerError> {
  if !path.exists() {
    return Ok(true);
  }

  let mtime = file_mtime(path)?;
  if mtime == cached.mtime {
    return Ok(false);
  }

  let hash = hash_file(path)?;
  Ok(hash != cached.hash)
}

/// Scan a case directory for tracked files whose content drifted.
///
/// Iterates the cache map (relative path → entry) and returns the relative
/// paths whose hash no longer matches. Detected drift is only reported; it
/// does not invalidate derived cached values.
pub fn scan_tree(root: &Path, cache: &BTreeMap<String, CacheEntry>) -> Result<Vec<String>, TrackerError> {
  let mut modified = Vec::new();

  for (rel, entry) in cache {
    let path = root.join(rel);
    if is_modified(&path, entry)? {
      debug!(file = %rel, "tracked file drifted");
      modified.push(rel.clone());
    }
  }

  Ok(modified)
}

fn file_mtime(path: &Path) -> Result<DateTime<Utc>, TrackerError> {
  let metadata = fs::metadata(path).map_err(|e| TrackerError::Stat {
    path: path.to_path_buf(),
    source: e,
  })?;
  let modified = metadata.modified().map_err(|e| TrackerError::Stat {
    path: path.to_path_buf(),
    source: e,
  })?;
  Ok(modified.into())
}
