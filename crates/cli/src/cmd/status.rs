//! Status command: per-state node counts and tracked-file drift.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use casegrid_lib::store::NodeStore;
use casegrid_lib::tracker;

use crate::output::{print_info, print_stat, print_success, print_warning};

pub fn cmd_status(root: &Path) -> Result<()> {
  let store = NodeStore::new(root);
  store.root_node()?;

  let nodes = store.all_nodes()?;
  if nodes.is_empty() {
    print_info("workspace holds no nodes yet");
    return Ok(());
  }

  let mut by_state: BTreeMap<&'static str, usize> = BTreeMap::new();
  let mut leaves = 0;
  let mut drifted = 0;

  for node in &nodes {
    *by_state.entry(node.document.state.as_str()).or_default() += 1;
    if node.is_leaf() {
      leaves += 1;
    }

    // Tracked configuration files altered outside the pipeline.
    if !node.document.cache.is_empty() {
      let case_dir = store.case_dir(&node.id);
      for file in tracker::scan_tree(&case_dir, &node.document.cache)? {
        drifted += 1;
        print_warning(&format!("{}: {file} modified outside the pipeline", node.id));
      }
    }
  }

  print_success(&format!("{} node(s), {} leaf case(s)", nodes.len(), leaves));
  for (state, count) in by_state {
    print_stat(state, &count.to_string());
  }
  if drifted > 0 {
    print_stat("drifted files", &drifted.to_string());
  }
  Ok(())
}
