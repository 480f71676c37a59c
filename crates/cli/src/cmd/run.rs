//! Run command: dispatch one operation across the tree.

use std::path::Path;

use anyhow::Result;

use casegrid_lib::lifecycle::{EngineConfig, LifecycleEngine, OperationHandler, OperationRegistry};
use casegrid_lib::store::NodeStore;

use crate::output::{print_error, print_info, print_stat, print_success, print_warning};

/// Handler registry for the common meshing/decomposition toolchain. Any
/// other operation name falls back to invoking a binary of the same name in
/// the case directory.
pub(crate) fn default_registry(operation: &str) -> OperationRegistry {
  let mut registry = OperationRegistry::with_defaults();

  for (name, argv) in [
    ("blockMesh", vec!["blockMesh"]),
    ("decomposePar", vec!["decomposePar", "-force"]),
    ("setFields", vec!["setFields"]),
  ] {
    registry.register(
      name,
      OperationHandler::External {
        argv: argv.into_iter().map(str::to_string).collect(),
      },
    );
  }

  if registry.get(operation).is_none() {
    registry.register(
      operation,
      OperationHandler::External {
        argv: vec![operation.to_string()],
      },
    );
  }

  registry
}

pub async fn cmd_run(root: &Path, operation: &str, parallelism: Option<usize>) -> Result<()> {
  let store = NodeStore::new(root);
  store.root_node()?;

  let mut config = EngineConfig::default();
  if let Some(parallelism) = parallelism {
    config.parallelism = parallelism;
  }

  let engine = LifecycleEngine::new(store, default_registry(operation), config);
  let report = engine.run_operation(operation).await?;

  if report.dispatched() == 0 {
    print_info(&format!("no nodes instantiate operation '{operation}'"));
    return Ok(());
  }

  print_success(&format!("operation '{operation}' dispatched"));
  print_stat("Completed", &report.completed.to_string());
  print_stat("Skipped", &report.skipped.len().to_string());

  for (id, reason) in &report.skipped {
    print_info(&format!("{id}: {reason}"));
  }
  for (id, message) in &report.failed {
    print_error(&format!("{id}: {message}"));
  }
  if !report.failed.is_empty() {
    print_warning(&format!("{} node(s) failed", report.failed.len()));
  }

  Ok(())
}
