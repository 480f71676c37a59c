//! View command: rebuild the symlink view over leaf cases.

use std::path::Path;

use anyhow::Result;

use casegrid_lib::store::NodeStore;
use casegrid_lib::view::export_view;

use crate::output::{print_info, print_success};

pub fn cmd_view(root: &Path) -> Result<()> {
  let store = NodeStore::new(root);
  store.root_node()?;

  let mapping = store.load_view_index()?;
  if mapping.is_empty() {
    print_info("no view index found; run 'cgrid expand' first");
    return Ok(());
  }

  let links = export_view(&store, &mapping)?;
  print_success(&format!("view rebuilt with {links} link(s)"));
  Ok(())
}
