//! Predicate queries over node statepoints and documents.
//!
//! A predicate is `(key, optional value, kind, negate)`. Evaluation descends
//! recursively into nested mapping entries, carrying the path of keys
//! traversed so a match can be attributed to a nested location (for example
//! `document/history/3/state`). Sequences default to latest-only mode: only
//! the last element is considered.
//!
//! Two surface syntaxes are accepted: the structured triple (deserialized
//! from `if` filters in a variation spec) and the shorthand infix form used
//! on the command line, e.g. `cells>=100` or `state==ready`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::node::{Node, NodeId};

#[derive(Debug, Error)]
pub enum QueryError {
  #[error("cannot parse filter '{0}'")]
  BadFilter(String),
}

/// Comparison kind of a predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
  #[default]
  Eq,
  Neq,
  Gt,
  Lt,
  Gte,
  Lte,
}

/// One selection predicate.
///
/// A predicate without a value only checks key existence and captures
/// whatever value is found there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
  pub key: String,

  #[serde(default)]
  pub value: Option<Value>,

  #[serde(default, rename = "predicate")]
  pub op: PredicateOp,

  #[serde(default)]
  pub negate: bool,
}

impl Predicate {
  pub fn new(key: impl Into<String>, value: Value, op: PredicateOp) -> Self {
    Self {
      key: key.into(),
      value: Some(value),
      op,
      negate: false,
    }
  }

  /// Existence-and-capture predicate: matches wherever the key is present.
  pub fn existence(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      value: None,
      op: PredicateOp::Eq,
      negate: false,
    }
  }

  /// Parse the shorthand infix form, e.g. `cells>=100`, `solver==GAMG` or a
  /// bare key for existence checks.
  pub fn parse_shorthand(input: &str) -> Result<Self, QueryError> {
    const SYMBOLS: [(&str, PredicateOp); 6] = [
      ("==", PredicateOp::Eq),
      ("!=", PredicateOp::Neq),
      (">=", PredicateOp::Gte),
      ("<=", PredicateOp::Lte),
      (">", PredicateOp::Gt),
      ("<", PredicateOp::Lt),
    ];

    for (symbol, op) in SYMBOLS {
      if let Some((key, raw)) = input.split_once(symbol) {
        let key = key.trim();
        let raw = raw.trim();
        if key.is_empty() || raw.is_empty() {
          return Err(QueryError::BadFilter(input.to_string()));
        }
        // Numbers and booleans parse as JSON; everything else is a string.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        return Ok(Predicate::new(key, value, op));
      }
    }

    let key = input.trim();
    if key.is_empty() {
      return Err(QueryError::BadFilter(input.to_string()));
    }
    Ok(Predicate::existence(key))
  }

  /// Test one found value against this predicate.
  fn test(&self, found: &Value) -> bool {
    let matched = match &self.value {
      None => true,
      Some(expected) => compare(found, expected, self.op),
    };
    matched != self.negate
  }
}

/// Compare two JSON values under a predicate kind.
///
/// Type-mismatched comparisons are non-matching, never an error.
fn compare(found: &Value, expected: &Value, op: PredicateOp) -> bool {
  use PredicateOp::*;

  match (found, expected) {
    (Value::Number(a), Value::Number(b)) => {
      let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
        return false;
      };
      match op {
        Eq => a == b,
        Neq => a != b,
        Gt => a > b,
        Lt => a < b,
        Gte => a >= b,
        Lte => a <= b,
      }
    }
    (Value::String(a), Value::String(b)) => match op {
      Eq => a == b,
      Neq => a != b,
      Gt => a > b,
      Lt => a < b,
      Gte => a >= b,
      Lte => a <= b,
    },
    (Value::Bool(a), Value::Bool(b)) => match op {
      Eq => a == b,
      Neq => a != b,
      _ => {
        debug!("ordering comparison on booleans never matches");
        false
      }
    },
    (Value::Null, Value::Null) => matches!(op, Eq),
    _ => {
      debug!(found = %found, expected = %expected, "type-mismatched comparison, treating as non-matching");
      false
    }
  }
}

/// Options controlling query evaluation.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// Require every predicate to match (default). Non-strict includes a node
  /// when at least one predicate matched.
  pub strict: bool,

  /// Consider only the last element of sequence values (default).
  pub latest_only: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      strict: true,
      latest_only: true,
    }
  }
}

/// One matching node with the key paths that satisfied the predicates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMatch {
  pub id: NodeId,
  pub captured: BTreeMap<String, Value>,
}

/// Evaluate predicates against a set of nodes.
pub fn query(nodes: &[Node], predicates: &[Predicate], options: &QueryOptions) -> Vec<QueryMatch> {
  let mut matches = Vec::new();

  for node in nodes {
    let flattened = match serde_json::to_value(node) {
      Ok(value) => value,
      Err(e) => {
        warn!(id = %node.id, error = %e, "failed to flatten node for querying");
        continue;
      }
    };

    if let Some(captured) = match_value(&flattened, predicates, options) {
      matches.push(QueryMatch {
        id: node.id.clone(),
        captured,
      });
    }
  }

  matches
}

/// Evaluate predicates against one flattened document.
///
/// Returns the captured `path → value` map when the document matches under
/// the given options, `None` otherwise.
pub fn match_value(value: &Value, predicates: &[Predicate], options: &QueryOptions) -> Option<BTreeMap<String, Value>> {
  if predicates.is_empty() {
    return None;
  }

  let mut captured = BTreeMap::new();
  let mut matched_all = true;
  let mut matched_any = false;

  for predicate in predicates {
    let mut hits = Vec::new();
    descend("", value, predicate, options, &mut hits);

    if hits.is_empty() {
      matched_all = false;
    } else {
      matched_any = true;
      for (path, found) in hits {
        captured.insert(path, found);
      }
    }
  }

  let included = if options.strict { matched_all } else { matched_any };
  included.then_some(captured)
}

fn join_path(path: &str, key: &str) -> String {
  if path.is_empty() {
    key.to_string()
  } else {
    format!("{path}/{key}")
  }
}

/// Recursive descent carrying the traversed key path.
fn descend(path: &str, value: &Value, predicate: &Predicate, options: &QueryOptions, hits: &mut Vec<(String, Value)>) {
  match value {
    Value::Object(map) => {
      for (key, child) in map {
        let child_path = join_path(path, key);

        if key == &predicate.key {
          test_candidate(&child_path, child, predicate, options, hits);
        }

        descend(&child_path, child, predicate, options, hits);
      }
    }
    Value::Array(items) => {
      if options.latest_only {
        if let Some(last) = items.last() {
          let child_path = join_path(path, &format!("{}", items.len() - 1));
          descend(&child_path, last, predicate, options, hits);
        }
      } else {
        for (index, item) in items.iter().enumerate() {
          let child_path = join_path(path, &format!("{index}"));
          descend(&child_path, item, predicate, options, hits);
        }
      }
    }
    _ => {}
  }
}

/// Test the value found at a matching key, unwrapping sequences per the
/// latest-only setting.
fn test_candidate(path: &str, found: &Value, predicate: &Predicate, options: &QueryOptions, hits: &mut Vec<(String, Value)>) {
  match found {
    Value::Array(items) => {
      if options.latest_only {
        if let Some(last) = items.last()
          && predicate.test(last)
        {
          hits.push((join_path(path, &format!("{}", items.len() - 1)), last.clone()));
        }
      } else {
        for (index, item) in items.iter().enumerate() {
          if predicate.test(item) {
            hits.push((join_path(path, &format!("{index}")), item.clone()));
          }
        }
      }
    }
    other => {
      if predicate.test(other) {
        hits.push((path.to_string(), other.clone()));
      }
    }
  }
}
