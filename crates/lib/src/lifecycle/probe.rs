//! Completion probing for long-running terminal operations.
//!
//! A submitted solver run produces a log that outlives the orchestrator
//! process. The probe reads the tail of that log and classifies the run:
//! a completion marker means the run finished, an error or resource marker
//! means it failed, and abrupt truncation without any marker means it is
//! still going (or died without a trace) and stays incomplete.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::consts::LOG_TAIL_BYTES;

#[derive(Debug, Error)]
pub enum ProbeError {
  #[error("failed to read log {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Classification of a probed solver log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
  Completed,
  /// No terminal marker in the tail; the run is unfinished or was cut off.
  Incomplete,
  Failure {
    reason: String,
  },
}

impl ProbeVerdict {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProbeVerdict::Completed => "completed",
      ProbeVerdict::Incomplete => "incomplete",
      ProbeVerdict::Failure { .. } => "failure",
    }
  }
}

/// Marker strings searched for in a log tail, first match wins in the order
/// resources → error → completion.
#[derive(Debug, Clone)]
pub struct ProbeMarkers {
  pub completion: Vec<String>,
  pub error: Vec<String>,
  pub resources: Vec<String>,
}

impl Default for ProbeMarkers {
  fn default() -> Self {
    Self {
      completion: vec!["End".to_string(), "Finalising parallel run".to_string()],
      error: vec!["FOAM FATAL ERROR".to_string(), "FOAM FATAL IO ERROR".to_string()],
      resources: vec![
        "not enough slots".to_string(),
        "Insufficient resources".to_string(),
      ],
    }
  }
}

/// Probe a solver log for a terminal marker.
///
/// A missing log means the run produced no output yet and is incomplete.
pub fn probe_log(path: &Path, markers: &ProbeMarkers) -> Result<ProbeVerdict, ProbeError> {
  let tail = match read_tail(path, LOG_TAIL_BYTES) {
    Ok(tail) => tail,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      debug!(path = %path.display(), "log not present yet");
      return Ok(ProbeVerdict::Incomplete);
    }
    Err(e) => {
      return Err(ProbeError::Read {
        path: path.to_path_buf(),
        source: e,
      });
    }
  };

  if let Some(marker) = first_match(&tail, &markers.resources) {
    return Ok(ProbeVerdict::Failure {
      reason: format!("insufficient parallel-execution resources ('{marker}')"),
    });
  }
  if let Some(marker) = first_match(&tail, &markers.error) {
    return Ok(ProbeVerdict::Failure {
      reason: format!("error marker in log tail ('{marker}')"),
    });
  }
  if first_match(&tail, &markers.completion).is_some() {
    return Ok(ProbeVerdict::Completed);
  }

  Ok(ProbeVerdict::Incomplete)
}

fn first_match<'a>(tail: &str, markers: &'a [String]) -> Option<&'a str> {
  markers.iter().map(String::as_str).find(|marker| tail.contains(marker))
}

/// Read up to `max_bytes` from the end of a file, lossily decoded.
fn read_tail(path: &Path, max_bytes: u64) -> io::Result<String> {
  let mut file = File::open(path)?;
  let len = file.metadata()?.len();
  file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;

  let mut buffer = Vec::new();
  file.read_to_end(&mut buffer)?;
  Ok(String::from_utf8_lossy(&buffer).to_string())
}
