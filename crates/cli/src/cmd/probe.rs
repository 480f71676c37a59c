//! Probe command: detect completion of submitted runs.

use std::path::Path;

use anyhow::Result;

use casegrid_lib::lifecycle::probe::ProbeVerdict;
use casegrid_lib::lifecycle::{EngineConfig, LifecycleEngine, LifecycleError, OperationRegistry};
use casegrid_lib::store::NodeStore;

use crate::output::{print_info, print_stat, print_success};

pub fn cmd_probe(root: &Path) -> Result<()> {
  let store = NodeStore::new(root);
  store.root_node()?;

  let leaves: Vec<_> = store.all_nodes()?.into_iter().filter(|n| n.is_leaf()).collect();
  let engine = LifecycleEngine::new(store, OperationRegistry::with_defaults(), EngineConfig::default());

  let mut completed = 0;
  let mut incomplete = 0;
  let mut failed = 0;
  let mut probed = 0;

  for node in leaves {
    match engine.probe_node(&node.id) {
      Ok(verdict) => {
        probed += 1;
        match verdict {
          ProbeVerdict::Completed => completed += 1,
          ProbeVerdict::Incomplete => incomplete += 1,
          ProbeVerdict::Failure { reason } => {
            failed += 1;
            print_info(&format!("{}: {reason}", node.id));
          }
        }
      }
      // Leaves that were never submitted are simply not probed.
      Err(LifecycleError::NoSubmission { .. }) => {}
      Err(e) => return Err(e.into()),
    }
  }

  if probed == 0 {
    print_info("no submitted runs to probe");
    return Ok(());
  }

  print_success("probe pass complete");
  print_stat("Completed", &completed.to_string());
  print_stat("Incomplete", &incomplete.to_string());
  print_stat("Failed", &failed.to_string());
  Ok(())
}
