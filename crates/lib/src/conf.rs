//! Accessor for simulation configuration files.
//!
//! The simulation tool's full dictionary grammar is handled by external
//! tooling; the orchestrator itself only needs to read and rewrite simple
//! `key value;` entries when a build step patches a case file. Lines it does
//! not understand are preserved verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfError {
  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write config {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Handle on one named configuration file.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
  path: PathBuf,
}

impl ConfigHandle {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Look up the value of a `key value;` entry. Returns the first match.
  pub fn get(&self, key: &str) -> Result<Option<String>, ConfError> {
    let content = self.read()?;
    for line in content.lines() {
      let trimmed = line.trim();
      if starts_with_separator(trimmed, key) {
        let rest = trimmed[key.len()..].trim();
        return Ok(Some(rest.trim_end_matches(';').trim().to_string()));
      }
    }
    Ok(None)
  }

  /// Set every key in the mapping, replacing existing entries in place and
  /// appending missing ones. Unknown lines are preserved.
  pub fn set(&self, mapping: &BTreeMap<String, Value>) -> Result<(), ConfError> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
      Err(e) => {
        return Err(ConfError::Read {
          path: self.path.clone(),
          source: e,
        });
      }
    };

    let mut remaining: BTreeMap<&str, &Value> = mapping.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
      let trimmed = line.trim();
      let replaced = remaining
        .keys()
        .copied()
        .find(|key| starts_with_separator(trimmed, key))
        .map(|key| key.to_string());

      match replaced.and_then(|key| remaining.remove(key.as_str()).map(|v| (key, v))) {
        Some((key, value)) => lines.push(render_entry(&key, value)),
        None => lines.push(line.to_string()),
      }
    }

    for (key, value) in remaining {
      lines.push(render_entry(key, value));
    }

    let mut output = lines.join("\n");
    output.push('\n');
    fs::write(&self.path, output).map_err(|e| ConfError::Write {
      path: self.path.clone(),
      source: e,
    })
  }

  fn read(&self) -> Result<String, ConfError> {
    fs::read_to_string(&self.path).map_err(|e| ConfError::Read {
      path: self.path.clone(),
      source: e,
    })
  }
}

/// True when the line starts with `key` followed by whitespace.
fn starts_with_separator(line: &str, key: &str) -> bool {
  line
    .strip_prefix(key)
    .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

fn render_entry(key: &str, value: &Value) -> String {
  format!("{key}    {};", render_value(value))
}

/// Render a JSON value the way dictionary files expect: strings bare,
/// everything else in JSON form.
fn render_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
