//! Query command: select nodes by predicates.

use std::path::Path;

use anyhow::Result;

use casegrid_lib::query::{query, Predicate, QueryOptions};
use casegrid_lib::store::NodeStore;

use crate::output::print_info;

pub fn cmd_query(root: &Path, filters: &[String], loose: bool, all_elements: bool) -> Result<()> {
  let store = NodeStore::new(root);
  store.root_node()?;

  let predicates = filters
    .iter()
    .map(|f| Predicate::parse_shorthand(f))
    .collect::<Result<Vec<_>, _>>()?;

  let options = QueryOptions {
    strict: !loose,
    latest_only: !all_elements,
  };

  let nodes = store.all_nodes()?;
  let matches = query(&nodes, &predicates, &options);

  for m in &matches {
    println!("{}", serde_json::to_string(m)?);
  }
  if matches.is_empty() {
    print_info("no nodes matched");
  }
  Ok(())
}
