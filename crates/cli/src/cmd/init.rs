//! Init command: create a workspace seeded with a base case.

use std::path::Path;

use anyhow::{bail, Result};

use casegrid_lib::materialize::copy_dir_recursive;
use casegrid_lib::node::{NodeState, Statepoint};
use casegrid_lib::store::NodeStore;

use crate::output::{print_info, print_stat, print_success};

pub fn cmd_init(root: &Path, case: &Path) -> Result<()> {
  if !case.is_dir() {
    bail!("base case directory not found: {}", case.display());
  }

  let store = NodeStore::init(root)?;
  let mut root_node = store.open(Statepoint::root())?;

  if root_node.document.init_dependent {
    print_info("workspace already initialized");
    return Ok(());
  }

  copy_dir_recursive(case, &store.case_dir(&root_node.id))?;

  root_node.document.state = NodeState::Ready;
  root_node.document.init_dependent = true;
  store.save_document(&root_node.id, &root_node.document)?;

  print_success(&format!("workspace initialized at {}", root.display()));
  print_stat("Root node", &root_node.id.to_string());
  print_stat("Base case", &case.display().to_string());
  Ok(())
}
