//! The declarative variation specification.
//!
//! A specification is an ordered list of operation descriptors; nesting via
//! `variation` adds further tree levels. The YAML surface looks like:
//!
//! ```yaml
//! - operation: blockMesh
//!   key: cells
//!   values: [8, 16]
//!   pre_build:
//!     - set_key: {file: system/blockMeshDict, key: resolution, value: "{cells}"}
//!   variation:
//!     - operation: solverSetup
//!       schema: "solver/{name}"
//!       values:
//!         - {name: PCG, preconditioner: IC}
//!         - {name: GAMG}
//! ```
//!
//! Value sets come from a literal `values` list or from a `generator`
//! substituting a variable across a numeric range. Per-value `if` predicate
//! lists and per-operation `parent` filters restrict where a level fires.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from loading or validating a variation specification.
///
/// These are fatal: a malformed specification aborts tree construction.
#[derive(Debug, Error)]
pub enum SpecError {
  #[error("failed to read spec {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse spec: {0}")]
  Parse(#[from] serde_yaml::Error),

  #[error("operation '{operation}' declares neither 'values' nor 'generator'")]
  MissingValues { operation: String },

  #[error("operation '{operation}' declares neither 'key' nor 'schema'")]
  MissingNaming { operation: String },

  #[error("operation '{operation}' has a bad generator range: {detail}")]
  BadGenerator { operation: String, detail: String },
}

/// One auxiliary step run before or after an operation's own effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
  /// Free-form shell command run in the node's case directory.
  Shell(String),

  /// Set a key in a named configuration file. The target file gets a
  /// copy-on-write break before the write.
  SetKey { file: String, key: String, value: Value },
}

impl BuildStep {
  /// Stable description used as the history command and idempotence key.
  pub fn describe(&self) -> String {
    match self {
      BuildStep::Shell(cmd) => cmd.clone(),
      BuildStep::SetKey { file, key, value } => {
        format!("setKey {file} {key}={value}")
      }
    }
  }
}

/// Numeric range generator: substitutes `{key}` into each template for every
/// step of the range, end inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSpec {
  pub key: String,
  /// `[start, end, step]`.
  pub values: Vec<f64>,
  pub template: Vec<Value>,
}

impl GeneratorSpec {
  /// Expand the range into concrete values, range outer, templates inner.
  pub fn expand(&self) -> Vec<Value> {
    let (start, end, step) = (self.values[0], self.values[1], self.values[2]);
    let mut out = Vec::new();
    let mut n = start;
    // Tolerance keeps the inclusive end stable under float stepping.
    let eps = step.abs() * 1e-9;
    while n <= end + eps {
      for template in &self.template {
        out.push(substitute(template, &self.key, n));
      }
      n += step;
    }
    out
  }
}

/// Replace `{key}` in string positions of a template value.
///
/// A string that is exactly the placeholder becomes a JSON number, so
/// generated parameters keep their numeric type.
fn substitute(template: &Value, key: &str, n: f64) -> Value {
  let placeholder = format!("{{{key}}}");
  match template {
    Value::String(s) if *s == placeholder => number_value(n),
    Value::String(s) => Value::String(s.replace(&placeholder, &format_number(n))),
    Value::Object(map) => Value::Object(
      map
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, key, n)))
        .collect(),
    ),
    Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, key, n)).collect()),
    other => other.clone(),
  }
}

/// Format a generator value: whole numbers without a trailing `.0`.
pub fn format_number(n: f64) -> String {
  if n.fract() == 0.0 && n.abs() < 1e15 {
    format!("{}", n as i64)
  } else {
    format!("{n}")
  }
}

fn number_value(n: f64) -> Value {
  if n.fract() == 0.0 && n.abs() < 1e15 {
    Value::from(n as i64)
  } else {
    Value::from(n)
  }
}

/// One operation descriptor: a single tree level under its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
  /// Operation the produced nodes instantiate.
  pub operation: String,

  /// Statepoint filter: the level only fires under parents whose effective
  /// parameters contain every listed key/value pair.
  #[serde(default)]
  pub parent: BTreeMap<String, Value>,

  /// Parameters merged into every value of this level.
  #[serde(default)]
  pub common: BTreeMap<String, Value>,

  #[serde(default)]
  pub pre_build: Vec<BuildStep>,

  #[serde(default)]
  pub post_build: Vec<BuildStep>,

  /// Simple naming: each value becomes `{key: value}`.
  #[serde(default)]
  pub key: Option<String>,

  /// Template naming: each mapping value is formatted through this path
  /// template (nested keys flattened with `/`).
  #[serde(default)]
  pub schema: Option<String>,

  #[serde(default)]
  pub values: Vec<Value>,

  #[serde(default)]
  pub generator: Option<GeneratorSpec>,

  /// Next tree level below every node of this level.
  #[serde(default)]
  pub variation: Vec<OperationSpec>,
}

impl OperationSpec {
  /// Resolve this level's value set, in deterministic order.
  pub fn resolve_values(&self) -> Vec<Value> {
    match &self.generator {
      Some(generator) => generator.expand(),
      None => self.values.clone(),
    }
  }
}

/// A full variation specification: the top tree level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariationSpec(pub Vec<OperationSpec>);

impl VariationSpec {
  pub fn load(path: &Path) -> Result<Self, SpecError> {
    let content = fs::read_to_string(path).map_err(|e| SpecError::Read {
      path: path.to_path_buf(),
      source: e,
    })?;
    Self::from_yaml_str(&content)
  }

  pub fn from_yaml_str(content: &str) -> Result<Self, SpecError> {
    let spec: VariationSpec = serde_yaml::from_str(content)?;
    spec.validate()?;
    Ok(spec)
  }

  /// Validate every level recursively. Errors here are fatal.
  pub fn validate(&self) -> Result<(), SpecError> {
    for operation in &self.0 {
      validate_operation(operation)?;
    }
    Ok(())
  }
}

fn validate_operation(op: &OperationSpec) -> Result<(), SpecError> {
  if op.values.is_empty() && op.generator.is_none() {
    return Err(SpecError::MissingValues {
      operation: op.operation.clone(),
    });
  }
  if op.key.is_none() && op.schema.is_none() {
    return Err(SpecError::MissingNaming {
      operation: op.operation.clone(),
    });
  }
  if let Some(generator) = &op.generator {
    if generator.values.len() != 3 {
      return Err(SpecError::BadGenerator {
        operation: op.operation.clone(),
        detail: format!("expected [start, end, step], got {} entries", generator.values.len()),
      });
    }
    if generator.values[2] <= 0.0 {
      return Err(SpecError::BadGenerator {
        operation: op.operation.clone(),
        detail: "step must be positive".to_string(),
      });
    }
    if generator.template.is_empty() {
      return Err(SpecError::BadGenerator {
        operation: op.operation.clone(),
        detail: "template must not be empty".to_string(),
      });
    }
  }
  for nested in &op.variation {
    validate_operation(nested)?;
  }
  Ok(())
}
