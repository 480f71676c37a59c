//! Submit command: hand terminal solver runs off out-of-process.

use std::path::Path;

use anyhow::Result;

use casegrid_lib::lifecycle::{DispatchOutcome, EngineConfig, LifecycleEngine};
use casegrid_lib::node::NodeState;
use casegrid_lib::store::NodeStore;

use crate::output::{print_error, print_info, print_stat, print_success};

use super::run::default_registry;

pub async fn cmd_submit(root: &Path) -> Result<()> {
  let store = NodeStore::new(root);
  store.root_node()?;

  // Only leaf nodes are eligible for terminal execution; completed runs are
  // left alone, everything else (including failed runs) may be resubmitted.
  let candidates: Vec<_> = store
    .all_nodes()?
    .into_iter()
    .filter(|n| n.is_leaf())
    .filter(|n| {
      matches!(
        n.document.state,
        NodeState::Unset | NodeState::Ready | NodeState::Failure | NodeState::Incomplete
      )
    })
    .collect();

  if candidates.is_empty() {
    print_info("no leaf nodes awaiting submission");
    return Ok(());
  }

  let mut submitted = 0;
  let mut skipped = 0;
  let mut failed = 0;

  for node in candidates {
    let registry = default_registry(&node.statepoint.operation);
    let engine = LifecycleEngine::new(store.clone(), registry, EngineConfig::default());

    match engine.submit(&node.id).await? {
      DispatchOutcome::Submitted => submitted += 1,
      DispatchOutcome::Skipped(reason) => {
        skipped += 1;
        print_info(&format!("{}: {reason}", node.id));
      }
      DispatchOutcome::Failed(message) => {
        failed += 1;
        print_error(&format!("{}: {message}", node.id));
      }
      DispatchOutcome::Completed => {}
    }
  }

  print_success("submission pass complete");
  print_stat("Submitted", &submitted.to_string());
  print_stat("Skipped", &skipped.to_string());
  print_stat("Failed", &failed.to_string());
  Ok(())
}
