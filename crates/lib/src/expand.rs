//! Variant-tree expansion.
//!
//! Walks a variation specification level by level and produces one child
//! node per accepted value, recursing into nested `variation` blocks. Each
//! recursive call returns its own id → path mapping fragment which the
//! caller merges, so there is no shared mutable accumulator threaded through
//! the recursion.
//!
//! Expansion order is deterministic (spec order, value order, generator
//! order): reruns against an unchanged specification re-derive identical
//! node identities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::consts::FLATTEN_SEPARATOR;
use crate::node::{Node, NodeId, Statepoint};
use crate::query::{self, Predicate, QueryOptions};
use crate::spec::{format_number, OperationSpec, SpecError, VariationSpec};
use crate::store::{NodeStore, StoreError};

/// Errors during tree expansion. All of them abort construction.
#[derive(Debug, Error)]
pub enum ExpandError {
  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("operation '{operation}': schema '{schema}' references unknown key '{key}'")]
  SchemaKey {
    operation: String,
    schema: String,
    key: String,
  },

  #[error("operation '{operation}': {detail}")]
  BadValue { operation: String, detail: String },
}

/// Result of expanding one subtree.
#[derive(Debug, Default)]
pub struct ExpansionReport {
  /// Every node created (or re-opened), in creation order.
  pub created: Vec<NodeId>,

  /// Leaf node id → human-readable view path.
  pub id_path_mapping: BTreeMap<NodeId, PathBuf>,
}

impl ExpansionReport {
  pub fn leaf_count(&self) -> usize {
    self.id_path_mapping.len()
  }

  fn merge(&mut self, other: ExpansionReport) {
    self.created.extend(other.created);
    self.id_path_mapping.extend(other.id_path_mapping);
  }
}

/// Expands a variation specification into the node tree.
#[derive(Debug, Clone)]
pub struct Expander {
  store: NodeStore,
}

impl Expander {
  pub fn new(store: NodeStore) -> Self {
    Self { store }
  }

  /// Expand the whole specification below the given root node.
  pub fn expand_tree(&self, root: &Node, spec: &VariationSpec) -> Result<ExpansionReport, ExpandError> {
    spec.validate()?;
    let report = self.expand_level(root, &spec.0, Path::new(""))?;
    info!(
      nodes = report.created.len(),
      leaves = report.leaf_count(),
      "tree expansion complete"
    );
    Ok(report)
  }

  fn expand_level(&self, parent: &Node, ops: &[OperationSpec], prefix: &Path) -> Result<ExpansionReport, ExpandError> {
    let mut report = ExpansionReport::default();
    let parent_params = parent.statepoint.effective_params();

    for op in ops {
      if !parent_filter_matches(&op.parent, &parent_params) {
        debug!(operation = %op.operation, parent = %parent.id, "parent filter does not match, skipping level");
        continue;
      }

      for raw in op.resolve_values() {
        let Some(value) = apply_if_filter(op, raw, &parent_params)? else {
          continue;
        };

        let (params, fragment) = derive_level(op, &value)?;
        let keys = params.keys().cloned().collect();

        let statepoint = Statepoint {
          params,
          keys,
          parent_id: Some(parent.id.clone()),
          has_child: !op.variation.is_empty(),
          operation: op.operation.clone(),
          pre_build: op.pre_build.clone(),
          post_build: op.post_build.clone(),
          parent: parent_params.clone(),
        };

        let node = self.store.open(statepoint)?;
        let path = prefix.join(&fragment);
        debug!(id = %node.id, path = %path.display(), "node expanded");
        report.created.push(node.id.clone());

        if node.is_leaf() {
          report.id_path_mapping.insert(node.id.clone(), path);
        } else {
          let nested = self.expand_level(&node, &op.variation, &path)?;
          report.merge(nested);
        }
      }
    }

    Ok(report)
  }
}

/// A level fires only under parents whose effective parameters contain every
/// listed key/value pair. An empty filter always fires.
fn parent_filter_matches(filter: &BTreeMap<String, Value>, parent_params: &BTreeMap<String, Value>) -> bool {
  filter.iter().all(|(key, value)| parent_params.get(key) == Some(value))
}

/// Evaluate a value's `if` predicate list against the parent's parameters.
///
/// Returns the value with the `if` key stripped, or `None` when filtered
/// out.
fn apply_if_filter(
  op: &OperationSpec,
  raw: Value,
  parent_params: &BTreeMap<String, Value>,
) -> Result<Option<Value>, ExpandError> {
  let Value::Object(map) = &raw else {
    return Ok(Some(raw));
  };
  let Some(condition) = map.get("if") else {
    return Ok(Some(raw));
  };

  let predicates: Vec<Predicate> =
    serde_json::from_value(condition.clone()).map_err(|e| ExpandError::BadValue {
      operation: op.operation.clone(),
      detail: format!("bad 'if' filter: {e}"),
    })?;

  let params_value = Value::Object(parent_params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
  if query::match_value(&params_value, &predicates, &QueryOptions::default()).is_none() {
    debug!(operation = %op.operation, "value filtered out by 'if' predicates");
    return Ok(None);
  }

  let mut cleaned = map.clone();
  cleaned.remove("if");
  Ok(Some(Value::Object(cleaned)))
}

/// Derive this level's parameters and its view-path fragment.
fn derive_level(op: &OperationSpec, value: &Value) -> Result<(BTreeMap<String, Value>, String), ExpandError> {
  let mut params: BTreeMap<String, Value> = op.common.clone();

  if let Some(key) = &op.key {
    params.insert(key.clone(), value.clone());
    let fragment = format!("{key}_{}", value_fragment(value));
    return Ok((params, fragment));
  }

  // Schema mode: the value must be a mapping.
  let Some(schema) = &op.schema else {
    // validate() has already rejected this shape.
    return Err(ExpandError::BadValue {
      operation: op.operation.clone(),
      detail: "neither 'key' nor 'schema' present".to_string(),
    });
  };
  let Value::Object(map) = value else {
    return Err(ExpandError::BadValue {
      operation: op.operation.clone(),
      detail: format!("schema mode requires mapping values, got {value}"),
    });
  };

  for (k, v) in map {
    params.insert(k.clone(), v.clone());
  }

  let flat = flatten_params(&params);
  let fragment = format_schema(op, schema, &flat)?;
  Ok((params, fragment))
}

/// Render a scalar as a path-fragment component.
fn value_fragment(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
    other => other.to_string(),
  }
}

/// Flatten nested parameter maps with a path separator, keeping scalars at
/// their joined key.
fn flatten_params(params: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
  let mut flat = BTreeMap::new();
  for (key, value) in params {
    flatten_into(key, value, &mut flat);
  }
  flat
}

fn flatten_into(prefix: &str, value: &Value, flat: &mut BTreeMap<String, Value>) {
  match value {
    Value::Object(map) => {
      for (key, child) in map {
        flatten_into(&format!("{prefix}{FLATTEN_SEPARATOR}{key}"), child, flat);
      }
    }
    other => {
      flat.insert(prefix.to_string(), other.clone());
    }
  }
}

/// Format a schema template (`"mesh/{cells}_{solver/name}"`) against the
/// flattened parameter dict.
fn format_schema(op: &OperationSpec, schema: &str, flat: &BTreeMap<String, Value>) -> Result<String, ExpandError> {
  let mut out = String::new();
  let mut rest = schema;

  while let Some(open) = rest.find('{') {
    out.push_str(&rest[..open]);
    let after = &rest[open + 1..];
    let Some(close) = after.find('}') else {
      return Err(ExpandError::BadValue {
        operation: op.operation.clone(),
        detail: format!("unterminated placeholder in schema '{schema}'"),
      });
    };
    let token = &after[..close];
    let Some(value) = flat.get(token) else {
      return Err(ExpandError::SchemaKey {
        operation: op.operation.clone(),
        schema: schema.to_string(),
        key: token.to_string(),
      });
    };
    out.push_str(&value_fragment(value));
    rest = &after[close + 1..];
  }
  out.push_str(rest);

  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::spec::VariationSpec;
  use serde_json::json;
  use tempfile::TempDir;

  fn setup_root(store: &NodeStore) -> Node {
    store.open(Statepoint::root()).unwrap()
  }

  fn expand(yaml: &str) -> (TempDir, NodeStore, ExpansionReport) {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let root = setup_root(&store);
    let spec = VariationSpec::from_yaml_str(yaml).unwrap();
    let report = Expander::new(store.clone()).expand_tree(&root, &spec).unwrap();
    (temp, store, report)
  }

  const TWO_LEVEL: &str = r#"
- operation: blockMesh
  key: cells
  values: [8, 16]
  variation:
    - operation: solverSetup
      key: solver
      values: [A, B]
"#;

  #[test]
  fn two_level_spec_yields_cartesian_product() {
    let (_temp, store, report) = expand(TWO_LEVEL);

    // 2 level-1 nodes + 4 leaves.
    assert_eq!(report.created.len(), 6);
    assert_eq!(report.leaf_count(), 4);

    let mut seen = Vec::new();
    for id in report.id_path_mapping.keys() {
      let node = store.get(id).unwrap();
      assert!(node.is_leaf());
      assert_eq!(node.statepoint.operation, "solverSetup");

      let all = node.statepoint.effective_params();
      let cells = all.get("cells").and_then(Value::as_i64).unwrap();
      let solver = all.get("solver").and_then(Value::as_str).unwrap().to_string();
      seen.push((cells, solver));
    }
    seen.sort();
    assert_eq!(
      seen,
      vec![
        (8, "A".to_string()),
        (8, "B".to_string()),
        (16, "A".to_string()),
        (16, "B".to_string()),
      ]
    );

    // Ids are unique by construction of the map; double-check count.
    assert_eq!(report.id_path_mapping.len(), 4);
  }

  #[test]
  fn leaf_statepoints_union_keys_from_every_level() {
    let (_temp, store, report) = expand(TWO_LEVEL);

    for id in report.id_path_mapping.keys() {
      let node = store.get(id).unwrap();
      assert_eq!(node.statepoint.keys, vec!["solver".to_string()]);
      assert!(node.statepoint.parent.contains_key("cells"));

      let all = node.statepoint.effective_params();
      assert!(all.contains_key("cells") && all.contains_key("solver"));
    }
  }

  #[test]
  fn intermediate_nodes_have_children() {
    let (_temp, store, report) = expand(TWO_LEVEL);

    for id in &report.created {
      let node = store.get(id).unwrap();
      if node.statepoint.operation == "blockMesh" {
        assert!(node.statepoint.has_child);
        assert!(!report.id_path_mapping.contains_key(id));
      }
    }
  }

  #[test]
  fn view_paths_compose_level_fragments() {
    let (_temp, _store, report) = expand(TWO_LEVEL);

    let paths: Vec<String> = report
      .id_path_mapping
      .values()
      .map(|p| p.to_string_lossy().to_string())
      .collect();
    for expected in ["cells_8/solver_A", "cells_8/solver_B", "cells_16/solver_A", "cells_16/solver_B"] {
      assert!(paths.contains(&expected.to_string()), "missing path {expected}");
    }
  }

  #[test]
  fn expansion_is_deterministic_across_reruns() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let root = setup_root(&store);
    let spec = VariationSpec::from_yaml_str(TWO_LEVEL).unwrap();
    let expander = Expander::new(store.clone());

    let first = expander.expand_tree(&root, &spec).unwrap();
    let second = expander.expand_tree(&root, &spec).unwrap();

    assert_eq!(first.created, second.created);
    assert_eq!(first.id_path_mapping, second.id_path_mapping);
  }

  #[test]
  fn parent_filter_skips_whole_level() {
    let yaml = r#"
- operation: blockMesh
  key: cells
  values: [8, 16]
  variation:
    - operation: decomposePar
      key: procs
      values: [2, 4]
      parent: {cells: 16}
"#;
    let (_temp, store, report) = expand(yaml);

    // Only the cells=16 branch fans out into procs variants.
    assert_eq!(report.leaf_count(), 3);

    let mut proc_leaves = 0;
    for id in report.id_path_mapping.keys() {
      let node = store.get(id).unwrap();
      if node.statepoint.operation == "decomposePar" {
        assert_eq!(node.statepoint.parent.get("cells"), Some(&json!(16)));
        proc_leaves += 1;
      }
    }
    assert_eq!(proc_leaves, 2);
  }

  #[test]
  fn if_filters_drop_values_against_parent_params() {
    let yaml = r#"
- operation: blockMesh
  key: cells
  values: [8, 16]
  variation:
    - operation: solverSetup
      schema: "solver/{name}"
      values:
        - {name: coarseOnly, if: [{key: cells, value: 8, predicate: eq}]}
        - {name: always}
"#;
    let (_temp, store, report) = expand(yaml);

    // cells=8 gets both solvers, cells=16 only the unconditional one.
    assert_eq!(report.leaf_count(), 3);

    for id in report.id_path_mapping.keys() {
      let node = store.get(id).unwrap();
      if node.statepoint.params.get("name") == Some(&json!("coarseOnly")) {
        assert_eq!(node.statepoint.parent.get("cells"), Some(&json!(8)));
      }
      // The `if` key never leaks into parameters.
      assert!(!node.statepoint.params.contains_key("if"));
    }
  }

  #[test]
  fn generator_levels_expand_in_tree() {
    let yaml = r#"
- operation: refineMesh
  key: level
  generator: {key: n, values: [0, 2, 1], template: ["{n}"]}
"#;
    let (_temp, store, report) = expand(yaml);

    assert_eq!(report.leaf_count(), 3);
    let mut levels: Vec<i64> = report
      .id_path_mapping
      .keys()
      .map(|id| {
        store
          .get(id)
          .unwrap()
          .statepoint
          .params
          .get("level")
          .and_then(Value::as_i64)
          .unwrap()
      })
      .collect();
    levels.sort();
    assert_eq!(levels, vec![0, 1, 2]);
  }

  #[test]
  fn schema_formats_nested_keys() {
    let yaml = r#"
- operation: solverSetup
  schema: "solver/{solver/name}_{cells}"
  values:
    - {cells: 8, solver: {name: PCG, preconditioner: IC}}
"#;
    let (_temp, _store, report) = expand(yaml);

    let paths: Vec<String> = report
      .id_path_mapping
      .values()
      .map(|p| p.to_string_lossy().to_string())
      .collect();
    assert_eq!(paths, vec!["solver/PCG_8".to_string()]);
  }

  #[test]
  fn schema_with_unknown_key_is_fatal() {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();
    let root = setup_root(&store);
    let spec = VariationSpec::from_yaml_str(
      r#"
- operation: solverSetup
  schema: "solver/{nope}"
  values:
    - {name: PCG}
"#,
    )
    .unwrap();

    let err = Expander::new(store).expand_tree(&root, &spec).unwrap_err();
    assert!(matches!(err, ExpandError::SchemaKey { key, .. } if key == "nope"));
  }

  #[test]
  fn common_params_merge_into_every_value() {
    let yaml = r#"
- operation: solverSetup
  key: solver
  common: {tolerance: 1e-6}
  values: [PCG, GAMG]
"#;
    let (_temp, store, report) = expand(yaml);

    for id in report.id_path_mapping.keys() {
      let node = store.get(id).unwrap();
      assert_eq!(node.statepoint.params.get("tolerance"), Some(&json!(1e-6)));
      assert_eq!(node.statepoint.keys.len(), 2);
    }
  }

  #[test]
  fn sibling_operations_union_at_one_level() {
    let yaml = r#"
- operation: blockMesh
  key: cells
  values: [8]
- operation: shell
  key: shell
  values: ["./Allrun.pre"]
"#;
    let (_temp, store, report) = expand(yaml);

    assert_eq!(report.leaf_count(), 2);
    let operations: Vec<String> = report
      .id_path_mapping
      .keys()
      .map(|id| store.get(id).unwrap().statepoint.operation)
      .collect();
    assert!(operations.contains(&"blockMesh".to_string()));
    assert!(operations.contains(&"shell".to_string()));
  }
}
