//! Expand command: build the variant tree from a variation specification.

use std::path::Path;

use anyhow::Result;

use casegrid_lib::expand::Expander;
use casegrid_lib::spec::VariationSpec;
use casegrid_lib::store::NodeStore;
use casegrid_lib::view::export_view;

use crate::output::{print_stat, print_success};

pub fn cmd_expand(root: &Path, spec_path: &Path) -> Result<()> {
  let store = NodeStore::new(root);
  let root_node = store.root_node()?;

  let spec = VariationSpec::load(spec_path)?;
  let expander = Expander::new(store.clone());
  let report = expander.expand_tree(&root_node, &spec)?;

  store.save_view_index(&report.id_path_mapping)?;
  let links = export_view(&store, &report.id_path_mapping)?;

  print_success(&format!("expanded {}", spec_path.display()));
  print_stat("Nodes", &report.created.len().to_string());
  print_stat("Leaves", &report.leaf_count().to_string());
  print_stat("View links", &links.to_string());
  Ok(())
}
