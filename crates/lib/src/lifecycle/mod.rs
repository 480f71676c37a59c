//! Per-node lifecycle state machine and operation dispatch.
//!
//! This module drives each node through
//! `unset → started → {tmp_lock | ready | failure}`:
//!
//! 1. Eligibility: an explicit ordered list of checks (not locked, parent
//!    ready, operation matches, materialized, runnable case) decides whether
//!    a dispatch may proceed; every rejection is a skip, never an error.
//! 2. On-start: the node transitions to `started`. Observing `started` again
//!    flips to `tmp_lock` instead, which later checks treat as busy.
//! 3. Steps: `pre_build` steps, the operation's own effect, `post_build`
//!    steps. Every executed step appends one history entry; steps already
//!    recorded successful are skipped on re-dispatch.
//! 4. Outcome: `ready` on success, `failure` on the first failing step.
//!
//! Terminal solver runs take the submit/probe path instead: submission hands
//! the command off out-of-process and only records `started`; a later probe
//! of the log tail moves the node to `completed`, `incomplete` or `failure`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::conf::ConfigHandle;
use crate::consts::{DEFAULT_REQUIRED_FILE, INLINE_LOG_MAX};
use crate::materialize::{self, materialize_siblings, Materializer, MaterializeError};
use crate::node::{HistoryEntry, LogRef, Node, NodeId, NodeState, StepOutcome, StepType};
use crate::spec::BuildStep;
use crate::store::{NodeStore, StoreError};
use crate::tracker;

pub mod probe;
pub mod runner;

use probe::{probe_log, ProbeError, ProbeMarkers, ProbeVerdict};
use runner::{shell_argv, CommandOutput, CommandRunner, RunnerError};

/// Errors from the engine itself. Operation failures are not errors: they
/// are recorded in the node's history and reported as [`DispatchOutcome::Failed`].
#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Materialize(#[from] MaterializeError),

  #[error(transparent)]
  Runner(#[from] RunnerError),

  #[error(transparent)]
  Probe(#[from] ProbeError),

  #[error("no handler registered for operation '{0}'")]
  UnknownOperation(String),

  #[error("node {id} has child levels and is not eligible for terminal execution")]
  NotALeaf { id: NodeId },

  #[error("node {id} has no submitted run to probe")]
  NoSubmission { id: NodeId },

  #[error("operation '{operation}' cannot be handed off out-of-process")]
  NotSubmittable { operation: String },

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Bounded worker count for sibling materialization.
  pub parallelism: usize,

  /// Timeout for inline external commands.
  pub timeout: Duration,

  /// File that must exist below a case directory for the node to count as
  /// runnable.
  pub required_file: PathBuf,

  /// Markers used by the completion probe.
  pub markers: ProbeMarkers,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      parallelism: 4,
      timeout: Duration::from_secs(3600),
      required_file: PathBuf::from(DEFAULT_REQUIRED_FILE),
      markers: ProbeMarkers::default(),
    }
  }
}

/// Internal file-mutation function: the operation's effect runs in-process.
pub type InternalFn = fn(&NodeStore, &mut Node) -> Result<String, String>;

/// How one operation's own effect executes.
#[derive(Debug, Clone)]
pub enum OperationHandler {
  /// External command; `{param}` placeholders resolve against the node's
  /// effective parameters.
  External { argv: Vec<String> },

  /// Free-form shell command taken from the node's `shell` parameter.
  Shell,

  /// Internal function.
  Internal { name: String, func: InternalFn },
}

/// Explicit operation name → handler mapping, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
  handlers: BTreeMap<String, OperationHandler>,
}

impl OperationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in free-form shell operation.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register("shell", OperationHandler::Shell);
    registry
  }

  pub fn register(&mut self, operation: impl Into<String>, handler: OperationHandler) {
    self.handlers.insert(operation.into(), handler);
  }

  pub fn get(&self, operation: &str) -> Option<&OperationHandler> {
    self.handlers.get(operation)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.handlers.keys().map(String::as_str)
  }
}

/// Why a dispatch was skipped. Skips are expected during normal sweeps
/// (lower levels not ready yet, re-entrant invocations) and never abort
/// sibling processing.
#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
  /// The node is `tmp_lock`ed by a concurrent dispatch.
  Locked,
  ParentNotReady { id: NodeId, state: NodeState },
  OperationMismatch { expected: String, requested: String },
  /// Materialization has not completed (and retrying it just failed).
  NotInitialized { detail: String },
  MissingRequiredFile { path: PathBuf },
}

impl std::fmt::Display for Ineligible {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Ineligible::Locked => write!(f, "busy: locked by a concurrent dispatch"),
      Ineligible::ParentNotReady { id, state } => {
        write!(f, "parent {id} is not ready (state {state})")
      }
      Ineligible::OperationMismatch { expected, requested } => {
        write!(f, "node instantiates '{expected}', not '{requested}'")
      }
      Ineligible::NotInitialized { detail } => write!(f, "not materialized: {detail}"),
      Ineligible::MissingRequiredFile { path } => {
        write!(f, "not a runnable case directory: {} is missing", path.display())
      }
    }
  }
}

/// Ordered eligibility checks evaluated before every dispatch.
#[derive(Debug, Clone, Copy)]
enum EligibilityCheck {
  NotLocked,
  ParentReady,
  OperationMatches,
  Initialized,
  RunnableCase,
}

const ELIGIBILITY_ORDER: &[EligibilityCheck] = &[
  EligibilityCheck::NotLocked,
  EligibilityCheck::ParentReady,
  EligibilityCheck::OperationMatches,
  EligibilityCheck::Initialized,
  EligibilityCheck::RunnableCase,
];

/// Outcome of one dispatch against one node.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
  Completed,
  /// Handed off out-of-process; completion is detected by a later probe.
  Submitted,
  Skipped(Ineligible),
  Failed(String),
}

/// Aggregate outcome of dispatching one operation across the tree.
#[derive(Debug, Default)]
pub struct OperationReport {
  pub completed: usize,
  pub skipped: Vec<(NodeId, String)>,
  pub failed: Vec<(NodeId, String)>,
}

impl OperationReport {
  pub fn dispatched(&self) -> usize {
    self.completed + self.skipped.len() + self.failed.len()
  }
}

/// Drives nodes through their state machine.
pub struct LifecycleEngine {
  store: NodeStore,
  materializer: Materializer,
  registry: OperationRegistry,
  runner: CommandRunner,
  config: EngineConfig,
}

impl LifecycleEngine {
  pub fn new(store: NodeStore, registry: OperationRegistry, config: EngineConfig) -> Self {
    Self {
      materializer: Materializer::new(store.clone()),
      runner: CommandRunner::new(config.timeout),
      store,
      registry,
      config,
    }
  }

  pub fn store(&self) -> &NodeStore {
    &self.store
  }

  /// Dispatch one operation against one node.
  pub async fn dispatch(&self, id: &NodeId, operation: &str) -> Result<DispatchOutcome, LifecycleError> {
    let mut node = self.store.get(id)?;

    // Resolve the handler before any state transition so an unregistered
    // operation cannot strand the node in `started`.
    let handler = self
      .registry
      .get(operation)
      .cloned()
      .ok_or_else(|| LifecycleError::UnknownOperation(operation.to_string()))?;

    if let Some(reason) = self.check_eligibility(&mut node, operation)? {
      debug!(id = %id, reason = %reason, "dispatch skipped");
      return Ok(DispatchOutcome::Skipped(reason));
    }

    if let Some(outcome) = self.transition_started(&mut node)? {
      return Ok(outcome);
    }

    let pre_build = node.statepoint.pre_build.clone();
    if let Err(message) = self.run_steps(&mut node, &pre_build, "pre_build").await {
      return self.fail(node, message);
    }

    if let Err(message) = self.execute_primary(&mut node, &handler).await {
      return self.fail(node, message);
    }

    let post_build = node.statepoint.post_build.clone();
    if let Err(message) = self.run_steps(&mut node, &post_build, "post_build").await {
      return self.fail(node, message);
    }

    node.document.state = NodeState::Ready;
    self.store.save_document(&node.id, &node.document)?;
    info!(id = %node.id, operation = operation, "operation completed");
    Ok(DispatchOutcome::Completed)
  }

  /// Dispatch one operation across every node instantiating it.
  ///
  /// Failures are node-local: one node's failure never aborts its siblings.
  pub async fn run_operation(&self, operation: &str) -> Result<OperationReport, LifecycleError> {
    let nodes = self.store.all_nodes()?;
    let candidates: Vec<NodeId> = nodes
      .iter()
      .filter(|n| n.statepoint.operation == operation)
      .map(|n| n.id.clone())
      .collect();

    // Materialize uninitialized siblings on the bounded pool first; a
    // deferred sibling (parent not ready yet) is retried on the next
    // invocation.
    let uninitialized: Vec<NodeId> = nodes
      .iter()
      .filter(|n| n.statepoint.operation == operation && !n.document.init_dependent)
      .map(|n| n.id.clone())
      .collect();
    if !uninitialized.is_empty() {
      for (id, result) in materialize_siblings(&self.materializer, uninitialized, self.config.parallelism).await {
        if let Err(e) = result {
          warn!(id = %id, error = %e, "materialization deferred");
        }
      }
    }

    let mut report = OperationReport::default();
    for id in candidates {
      match self.dispatch(&id, operation).await? {
        DispatchOutcome::Completed | DispatchOutcome::Submitted => report.completed += 1,
        DispatchOutcome::Skipped(reason) => report.skipped.push((id, reason.to_string())),
        DispatchOutcome::Failed(message) => report.failed.push((id, message)),
      }
    }

    info!(
      operation = operation,
      completed = report.completed,
      skipped = report.skipped.len(),
      failed = report.failed.len(),
      "operation dispatch complete"
    );
    Ok(report)
  }

  /// Hand a leaf node's terminal operation off for out-of-process execution.
  ///
  /// Unlike inline dispatch this never checks the history for an earlier
  /// success: resubmission is the one explicitly re-runnable step.
  pub async fn submit(&self, id: &NodeId) -> Result<DispatchOutcome, LifecycleError> {
    let mut node = self.store.get(id)?;
    if !node.is_leaf() {
      return Err(LifecycleError::NotALeaf { id: id.clone() });
    }

    let operation = node.statepoint.operation.clone();
    let handler = self
      .registry
      .get(&operation)
      .cloned()
      .ok_or_else(|| LifecycleError::UnknownOperation(operation.clone()))?;

    if let Some(reason) = self.check_eligibility(&mut node, &operation)? {
      debug!(id = %id, reason = %reason, "submit skipped");
      return Ok(DispatchOutcome::Skipped(reason));
    }

    if let Some(outcome) = self.transition_started(&mut node)? {
      return Ok(outcome);
    }

    let pre_build = node.statepoint.pre_build.clone();
    if let Err(message) = self.run_steps(&mut node, &pre_build, "pre_build").await {
      return self.fail(node, message);
    }

    let params = node.statepoint.effective_params();
    let argv = match &handler {
      OperationHandler::External { argv } => substitute_argv(argv, &params),
      OperationHandler::Shell => match shell_param(&params) {
        Some(cmd) => shell_argv(&cmd),
        None => return self.fail(node, "shell operation requires a 'shell' parameter".to_string()),
      },
      OperationHandler::Internal { .. } => {
        return Err(LifecycleError::NotSubmittable { operation });
      }
    };

    let case_dir = self.store.case_dir(&node.id);
    let log_path = case_dir.join(format!("log.{operation}"));

    match self.runner.spawn_detached(&argv, &case_dir, &log_path) {
      Ok(pid) => {
        node.document.record(HistoryEntry {
          command: argv.join(" "),
          step_type: StepType::Shell,
          log: LogRef::File(log_path),
          state: StepOutcome::Started,
          timestamp: Utc::now(),
          flags: vec!["submitted".to_string(), format!("pid:{pid}")],
        });
        self.store.save_document(&node.id, &node.document)?;
        Ok(DispatchOutcome::Submitted)
      }
      Err(e) => self.fail(node, e.to_string()),
    }
  }

  /// Probe the last submitted run's log and update the node's state.
  pub fn probe_node(&self, id: &NodeId) -> Result<ProbeVerdict, LifecycleError> {
    let mut node = self.store.get(id)?;

    let submitted = node
      .document
      .history
      .iter()
      .rev()
      .find(|e| e.flags.iter().any(|f| f == "submitted"))
      .cloned()
      .ok_or_else(|| LifecycleError::NoSubmission { id: id.clone() })?;
    let LogRef::File(log_path) = &submitted.log else {
      return Err(LifecycleError::NoSubmission { id: id.clone() });
    };

    let verdict = probe_log(log_path, &self.config.markers)?;
    match &verdict {
      ProbeVerdict::Completed => {
        node.document.state = NodeState::Completed;
        node.document.record(HistoryEntry {
          command: format!("probe {}", submitted.command),
          step_type: StepType::Internal,
          log: LogRef::Inline("completion marker found".to_string()),
          state: StepOutcome::Success,
          timestamp: Utc::now(),
          flags: vec!["probe".to_string()],
        });
      }
      ProbeVerdict::Incomplete => {
        // Nothing finished; keep the ledger quiet and only reflect the
        // state so repeated probes do not pile up entries.
        node.document.state = NodeState::Incomplete;
      }
      ProbeVerdict::Failure { reason } => {
        node.document.state = NodeState::Failure;
        node.document.record(HistoryEntry {
          command: format!("probe {}", submitted.command),
          step_type: StepType::Internal,
          log: LogRef::Inline(reason.clone()),
          state: StepOutcome::Failure,
          timestamp: Utc::now(),
          flags: vec!["probe".to_string()],
        });
      }
    }

    self.store.save_document(&node.id, &node.document)?;
    info!(id = %id, verdict = verdict.as_str(), "probe finished");
    Ok(verdict)
  }

  /// Evaluate the ordered eligibility checks; the first rejection wins.
  fn check_eligibility(&self, node: &mut Node, operation: &str) -> Result<Option<Ineligible>, LifecycleError> {
    for check in ELIGIBILITY_ORDER {
      let skip = match check {
        EligibilityCheck::NotLocked => (node.document.state == NodeState::TmpLock).then_some(Ineligible::Locked),
        EligibilityCheck::ParentReady => match &node.statepoint.parent_id {
          None => None,
          Some(parent_id) => {
            let parent = self.store.get(parent_id)?;
            (parent.document.state != NodeState::Ready).then(|| Ineligible::ParentNotReady {
              id: parent_id.clone(),
              state: parent.document.state,
            })
          }
        },
        EligibilityCheck::OperationMatches => {
          (node.statepoint.operation != operation).then(|| Ineligible::OperationMismatch {
            expected: node.statepoint.operation.clone(),
            requested: operation.to_string(),
          })
        }
        EligibilityCheck::Initialized => {
          if node.document.init_dependent {
            None
          } else {
            match self.materializer.materialize(node) {
              Ok(_) => None,
              Err(e) => Some(Ineligible::NotInitialized { detail: e.to_string() }),
            }
          }
        }
        EligibilityCheck::RunnableCase => {
          let required = self.store.case_dir(&node.id).join(&self.config.required_file);
          (!required.exists()).then(|| Ineligible::MissingRequiredFile { path: required })
        }
      };

      if let Some(reason) = skip {
        return Ok(Some(reason));
      }
    }
    Ok(None)
  }

  /// On-start transition. A node already `started` flips to `tmp_lock` and
  /// the dispatch becomes a no-op (re-entrant invocation detected).
  fn transition_started(&self, node: &mut Node) -> Result<Option<DispatchOutcome>, LifecycleError> {
    if node.document.state == NodeState::Started {
      node.document.state = NodeState::TmpLock;
      self.store.save_document(&node.id, &node.document)?;
      warn!(id = %node.id, "re-entrant dispatch detected, node locked");
      return Ok(Some(DispatchOutcome::Skipped(Ineligible::Locked)));
    }

    node.document.state = NodeState::Started;
    self.store.save_document(&node.id, &node.document)?;
    Ok(None)
  }

  /// Record failure and transition the node.
  fn fail(&self, mut node: Node, message: String) -> Result<DispatchOutcome, LifecycleError> {
    node.document.state = NodeState::Failure;
    self.store.save_document(&node.id, &node.document)?;
    error!(id = %node.id, error = %message, "operation failed");
    Ok(DispatchOutcome::Failed(message))
  }

  /// Run a list of build steps, recording one history entry each.
  async fn run_steps(&self, node: &mut Node, steps: &[BuildStep], phase: &str) -> Result<(), String> {
    let case_dir = self.store.case_dir(&node.id);

    for step in steps {
      let command = step.describe();
      if node.document.step_succeeded(&command) {
        debug!(id = %node.id, step = %command, "step already succeeded, skipping");
        continue;
      }

      match step {
        BuildStep::Shell(cmd) => {
          let result = self.runner.run_shell(cmd, &case_dir).await;
          self.complete_command(node, &command, result, vec![phase.to_string()])?;
        }
        BuildStep::SetKey { file, key, value } => {
          let path = case_dir.join(file);
          let result = materialize::break_link(&path)
            .map_err(|e| e.to_string())
            .and_then(|_| {
              let mut mapping = BTreeMap::new();
              mapping.insert(key.clone(), value.clone());
              ConfigHandle::new(&path).set(&mapping).map_err(|e| e.to_string())
            })
            .and_then(|_| tracker::compute(&path).map_err(|e| e.to_string()));

          match result {
            Ok(entry) => {
              node.document.cache.insert(file.clone(), entry);
              self
                .record_step(node, &command, StepType::Internal, StepOutcome::Success, "", vec![phase.to_string()])
                .map_err(|e| e.to_string())?;
            }
            Err(message) => {
              self
                .record_step(
                  node,
                  &command,
                  StepType::Internal,
                  StepOutcome::Failure,
                  &message,
                  vec![phase.to_string()],
                )
                .map_err(|e| e.to_string())?;
              return Err(format!("step '{command}' failed: {message}"));
            }
          }
        }
      }
    }

    Ok(())
  }

  /// Execute the operation's own effect.
  async fn execute_primary(&self, node: &mut Node, handler: &OperationHandler) -> Result<(), String> {
    let case_dir = self.store.case_dir(&node.id);
    let params = node.statepoint.effective_params();

    match handler {
      OperationHandler::External { argv } => {
        let argv = substitute_argv(argv, &params);
        let command = argv.join(" ");
        if node.document.step_succeeded(&command) {
          debug!(id = %node.id, step = %command, "operation already succeeded, skipping");
          return Ok(());
        }
        let result = self.runner.run(&argv, &case_dir).await;
        self.complete_command(node, &command, result, vec!["operation".to_string()])
      }
      OperationHandler::Shell => {
        let Some(cmd) = shell_param(&params) else {
          return Err("shell operation requires a 'shell' parameter".to_string());
        };
        if node.document.step_succeeded(&cmd) {
          debug!(id = %node.id, step = %cmd, "operation already succeeded, skipping");
          return Ok(());
        }
        let result = self.runner.run_shell(&cmd, &case_dir).await;
        self.complete_command(node, &cmd, result, vec!["operation".to_string()])
      }
      OperationHandler::Internal { name, func } => {
        if node.document.step_succeeded(name) {
          debug!(id = %node.id, step = %name, "operation already succeeded, skipping");
          return Ok(());
        }
        match func(&self.store, node) {
          Ok(output) => self
            .record_step(
              node,
              name,
              StepType::Internal,
              StepOutcome::Success,
              &output,
              vec!["operation".to_string()],
            )
            .map_err(|e| e.to_string()),
          Err(message) => {
            self
              .record_step(
                node,
                name,
                StepType::Internal,
                StepOutcome::Failure,
                &message,
                vec!["operation".to_string()],
              )
              .map_err(|e| e.to_string())?;
            Err(format!("internal step '{name}' failed: {message}"))
          }
        }
      }
    }
  }

  /// Record a finished command's outcome; failing commands become step
  /// failures with their captured output preserved.
  fn complete_command(
    &self,
    node: &mut Node,
    command: &str,
    result: Result<CommandOutput, RunnerError>,
    flags: Vec<String>,
  ) -> Result<(), String> {
    match result {
      Ok(output) if output.success => self
        .record_step(node, command, StepType::Shell, StepOutcome::Success, &output.combined, flags)
        .map_err(|e| e.to_string()),
      Ok(output) => {
        self
          .record_step(node, command, StepType::Shell, StepOutcome::Failure, &output.combined, flags)
          .map_err(|e| e.to_string())?;
        Err(format!("'{command}' exited with code {:?}", output.code))
      }
      Err(e) => {
        let message = e.to_string();
        self
          .record_step(node, command, StepType::Shell, StepOutcome::Failure, &message, flags)
          .map_err(|e| e.to_string())?;
        Err(message)
      }
    }
  }

  /// Append one history entry and persist the document.
  fn record_step(
    &self,
    node: &mut Node,
    command: &str,
    step_type: StepType,
    state: StepOutcome,
    output: &str,
    flags: Vec<String>,
  ) -> Result<(), LifecycleError> {
    let log = self.make_log(node, command, output)?;
    node.document.record(HistoryEntry {
      command: command.to_string(),
      step_type,
      log,
      state,
      timestamp: Utc::now(),
      flags,
    });
    self.store.save_document(&node.id, &node.document)?;
    Ok(())
  }

  /// Inline small output; spill anything larger to a log file.
  fn make_log(&self, node: &Node, command: &str, output: &str) -> Result<LogRef, LifecycleError> {
    if output.len() <= INLINE_LOG_MAX {
      return Ok(LogRef::Inline(output.to_string()));
    }

    let name = format!("{}-{}.log", sanitize(command), node.document.history.len());
    let path = self.store.logs_dir(&node.id).join(name);
    fs::write(&path, output).map_err(|e| LifecycleError::Io {
      path: path.clone(),
      source: e,
    })?;
    Ok(LogRef::File(path))
  }
}

/// Resolve `{param}` placeholders in an argv template.
fn substitute_argv(argv: &[String], params: &BTreeMap<String, Value>) -> Vec<String> {
  argv
    .iter()
    .map(|arg| {
      let mut resolved = arg.clone();
      for (key, value) in params {
        resolved = resolved.replace(&format!("{{{key}}}"), &param_str(value));
      }
      resolved
    })
    .collect()
}

fn shell_param(params: &BTreeMap<String, Value>) -> Option<String> {
  params.get("shell").and_then(Value::as_str).map(str::to_string)
}

fn param_str(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// File-name-safe rendition of a step command.
fn sanitize(command: &str) -> String {
  let mut out: String = command
    .chars()
    .take(40)
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
    .collect();
  if out.is_empty() {
    out.push_str("step");
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::Statepoint;
  use serde_json::json;
  use tempfile::TempDir;

  fn touch_marker(store: &NodeStore, node: &mut Node) -> Result<String, String> {
    let path = store.case_dir(&node.id).join("marker");
    std::fs::write(&path, "ok").map_err(|e| e.to_string())?;
    node.document.derived.insert("marker_bytes".to_string(), json!(2));
    Ok("marker written".to_string())
  }

  fn always_fails(_store: &NodeStore, _node: &mut Node) -> Result<String, String> {
    Err("boom".to_string())
  }

  fn test_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::with_defaults();
    registry.register(
      "prep",
      OperationHandler::Internal {
        name: "prep".to_string(),
        func: touch_marker,
      },
    );
    registry.register(
      "broken",
      OperationHandler::Internal {
        name: "broken".to_string(),
        func: always_fails,
      },
    );
    registry
  }

  fn test_config() -> EngineConfig {
    EngineConfig {
      parallelism: 2,
      timeout: Duration::from_secs(10),
      ..EngineConfig::default()
    }
  }

  /// Workspace with a ready root whose case holds the required file.
  fn setup_workspace() -> (TempDir, NodeStore) {
    let temp = TempDir::new().unwrap();
    let store = NodeStore::init(temp.path()).unwrap();

    let mut root = store.open(Statepoint::root()).unwrap();
    let case = store.case_dir(&root.id);
    std::fs::create_dir_all(case.join("system")).unwrap();
    std::fs::write(case.join("system/controlDict"), "deltaT 0.1;\n").unwrap();

    root.document.state = NodeState::Ready;
    root.document.init_dependent = true;
    store.save_document(&root.id, &root.document).unwrap();
    (temp, store)
  }

  fn child_node(store: &NodeStore, operation: &str, params: &[(&str, Value)]) -> Node {
    let root = store.root_node().unwrap();
    let mut sp = Statepoint::root();
    sp.parent_id = Some(root.id);
    sp.has_child = false;
    sp.operation = operation.to_string();
    for (k, v) in params {
      sp.params.insert(k.to_string(), v.clone());
      sp.keys.push(k.to_string());
    }
    store.open(sp).unwrap()
  }

  fn engine(store: &NodeStore) -> LifecycleEngine {
    LifecycleEngine::new(store.clone(), test_registry(), test_config())
  }

  #[tokio::test]
  async fn dispatch_runs_steps_and_reaches_ready() {
    let (_temp, store) = setup_workspace();
    let mut node = child_node(&store, "prep", &[("cells", json!(8))]);
    node.statepoint.pre_build.push(BuildStep::Shell("echo pre".to_string()));
    node.statepoint.post_build.push(BuildStep::Shell("echo post".to_string()));
    // Rebuild with the steps baked into the statepoint.
    let node = store.open(node.statepoint).unwrap();

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    let node = store.get(&node.id).unwrap();
    assert_eq!(node.document.state, NodeState::Ready);
    assert!(store.case_dir(&node.id).join("marker").exists());

    let commands: Vec<&str> = node.document.history.iter().map(|e| e.command.as_str()).collect();
    assert_eq!(commands, vec!["echo pre", "prep", "echo post"]);
    assert!(node.document.history.iter().all(|e| e.state == StepOutcome::Success));

    // Cheap derived values written by the internal operation are persisted.
    assert_eq!(node.document.derived.get("marker_bytes"), Some(&json!(2)));
  }

  #[tokio::test]
  async fn failing_operation_ends_in_failure_state() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "broken", &[("x", json!(1))]);

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "broken").await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed(_)));

    let node = store.get(&node.id).unwrap();
    assert_eq!(node.document.state, NodeState::Failure);
    assert_eq!(node.document.last_entry().unwrap().state, StepOutcome::Failure);
  }

  #[tokio::test]
  async fn reentrant_dispatch_flips_to_tmp_lock_and_noops() {
    let (_temp, store) = setup_workspace();
    let mut node = child_node(&store, "prep", &[("cells", json!(8))]);

    // Simulate an in-flight dispatch from another invocation.
    node.document.state = NodeState::Started;
    node.document.init_dependent = true;
    store.save_document(&node.id, &node.document).unwrap();

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Skipped(Ineligible::Locked));

    let reloaded = store.get(&node.id).unwrap();
    assert_eq!(reloaded.document.state, NodeState::TmpLock);
    assert!(reloaded.document.history.is_empty(), "primary operation must not run");

    // Subsequent dispatches observe the lock and no-op as well.
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Skipped(Ineligible::Locked));
    assert!(store.get(&node.id).unwrap().document.history.is_empty());
  }

  #[tokio::test]
  async fn operation_mismatch_skips() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "prep", &[("cells", json!(8))]);

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "broken").await.unwrap();
    assert!(matches!(
      outcome,
      DispatchOutcome::Skipped(Ineligible::OperationMismatch { .. })
    ));
    assert_eq!(store.get(&node.id).unwrap().document.state, NodeState::Unset);
  }

  #[tokio::test]
  async fn parent_not_ready_skips() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "prep", &[("cells", json!(8))]);

    // Demote the root.
    let mut root = store.root_node().unwrap();
    root.document.state = NodeState::Started;
    store.save_document(&root.id, &root.document).unwrap();

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert!(matches!(
      outcome,
      DispatchOutcome::Skipped(Ineligible::ParentNotReady { .. })
    ));
  }

  #[tokio::test]
  async fn dispatch_triggers_materialization() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "prep", &[("cells", json!(8))]);
    assert!(!node.document.init_dependent);

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    let node = store.get(&node.id).unwrap();
    assert!(node.document.init_dependent);
    assert!(store.case_dir(&node.id).join("system/controlDict").exists());
  }

  #[tokio::test]
  async fn missing_required_file_skips() {
    let (_temp, store) = setup_workspace();

    // Strip the required file from the root case before the child links it.
    let root = store.root_node().unwrap();
    std::fs::remove_file(store.case_dir(&root.id).join("system/controlDict")).unwrap();

    let node = child_node(&store, "prep", &[("cells", json!(8))]);
    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert!(matches!(
      outcome,
      DispatchOutcome::Skipped(Ineligible::MissingRequiredFile { .. })
    ));
  }

  #[tokio::test]
  async fn successful_steps_are_not_rerun() {
    let (_temp, store) = setup_workspace();
    let mut node = child_node(&store, "prep", &[("cells", json!(8))]);
    node.statepoint.pre_build.push(BuildStep::Shell("echo once".to_string()));
    let node = store.open(node.statepoint).unwrap();

    let engine = engine(&store);
    assert_eq!(engine.dispatch(&node.id, "prep").await.unwrap(), DispatchOutcome::Completed);
    let history_len = store.get(&node.id).unwrap().document.history.len();

    // Re-dispatch: every step already succeeded, nothing is re-executed.
    assert_eq!(engine.dispatch(&node.id, "prep").await.unwrap(), DispatchOutcome::Completed);
    let node = store.get(&node.id).unwrap();
    assert_eq!(node.document.history.len(), history_len);
    assert_eq!(node.document.state, NodeState::Ready);
  }

  #[tokio::test]
  async fn failing_shell_step_records_failure_entry() {
    let (_temp, store) = setup_workspace();
    let mut node = child_node(&store, "prep", &[("cells", json!(8))]);
    node.statepoint.pre_build.push(BuildStep::Shell("exit 1".to_string()));
    let node = store.open(node.statepoint).unwrap();

    let engine = engine(&store);
    let outcome = engine.dispatch(&node.id, "prep").await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed(_)));

    let node = store.get(&node.id).unwrap();
    assert_eq!(node.document.state, NodeState::Failure);
    let last = node.document.last_entry().unwrap();
    assert_eq!(last.command, "exit 1");
    assert_eq!(last.state, StepOutcome::Failure);
    assert_eq!(last.step_type, StepType::Shell);
  }

  #[tokio::test]
  async fn set_key_step_breaks_link_and_tracks_file() {
    let (_temp, store) = setup_workspace();
    let mut node = child_node(&store, "prep", &[("cells", json!(8))]);
    node.statepoint.pre_build.push(BuildStep::SetKey {
      file: "system/controlDict".to_string(),
      key: "deltaT".to_string(),
      value: json!(0.01),
    });
    let node = store.open(node.statepoint).unwrap();

    let engine = engine(&store);
    assert_eq!(engine.dispatch(&node.id, "prep").await.unwrap(), DispatchOutcome::Completed);

    // The child holds a private, rewritten copy.
    let child_file = store.case_dir(&node.id).join("system/controlDict");
    assert!(!std::fs::symlink_metadata(&child_file).unwrap().file_type().is_symlink());
    assert!(std::fs::read_to_string(&child_file).unwrap().contains("deltaT    0.01;"));

    // The parent's file is untouched.
    let root = store.root_node().unwrap();
    let parent_file = store.case_dir(&root.id).join("system/controlDict");
    assert_eq!(std::fs::read_to_string(&parent_file).unwrap(), "deltaT 0.1;\n");

    // The rewrite went through the change tracker.
    let node = store.get(&node.id).unwrap();
    let entry = node.document.cache.get("system/controlDict").unwrap();
    assert!(!tracker::is_modified(&child_file, entry).unwrap());
  }

  #[tokio::test]
  async fn unknown_operation_is_an_engine_error() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "mystery", &[("x", json!(1))]);

    let engine = engine(&store);
    let err = engine.dispatch(&node.id, "mystery").await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownOperation(_)));

    // The node was never started.
    assert_eq!(store.get(&node.id).unwrap().document.state, NodeState::Unset);
  }

  #[tokio::test]
  async fn run_operation_failures_are_node_local() {
    let (_temp, store) = setup_workspace();
    let good = child_node(&store, "shell", &[("shell", json!("true"))]);
    let bad = child_node(&store, "shell", &[("shell", json!("exit 1"))]);

    let engine = engine(&store);
    let report = engine.run_operation("shell").await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad.id);
    assert_eq!(store.get(&good.id).unwrap().document.state, NodeState::Ready);
    assert_eq!(store.get(&bad.id).unwrap().document.state, NodeState::Failure);
  }

  #[tokio::test]
  async fn submit_records_started_and_probe_completes() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "shell", &[("shell", json!("echo Time = 1; echo End"))]);

    let engine = engine(&store);
    let outcome = engine.submit(&node.id).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Submitted);

    let submitted = store.get(&node.id).unwrap();
    assert_eq!(submitted.document.state, NodeState::Started);
    let last = submitted.document.last_entry().unwrap();
    assert_eq!(last.state, StepOutcome::Started);
    assert!(last.flags.iter().any(|f| f == "submitted"));
    assert!(matches!(last.log, LogRef::File(_)));

    // Let the detached child finish writing its log.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let verdict = engine.probe_node(&node.id).unwrap();
    assert_eq!(verdict, ProbeVerdict::Completed);
    assert_eq!(store.get(&node.id).unwrap().document.state, NodeState::Completed);
  }

  #[tokio::test]
  async fn probe_classifies_incomplete_and_failure() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "shell", &[("shell", json!("echo Time = 1"))]);

    let engine = engine(&store);
    engine.submit(&node.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Log exists but carries no terminal marker.
    assert_eq!(engine.probe_node(&node.id).unwrap(), ProbeVerdict::Incomplete);
    assert_eq!(store.get(&node.id).unwrap().document.state, NodeState::Incomplete);

    // Append an error marker and probe again.
    let log_path = store.case_dir(&node.id).join("log.shell");
    let mut content = std::fs::read_to_string(&log_path).unwrap();
    content.push_str("--> FOAM FATAL ERROR: divergence\n");
    std::fs::write(&log_path, content).unwrap();

    assert!(matches!(engine.probe_node(&node.id).unwrap(), ProbeVerdict::Failure { .. }));
    assert_eq!(store.get(&node.id).unwrap().document.state, NodeState::Failure);
  }

  #[tokio::test]
  async fn submit_rejects_non_leaf_nodes() {
    let (_temp, store) = setup_workspace();
    let root = store.root_node().unwrap();

    let engine = engine(&store);
    let err = engine.submit(&root.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotALeaf { .. }));
  }

  #[tokio::test]
  async fn probe_without_submission_errors() {
    let (_temp, store) = setup_workspace();
    let node = child_node(&store, "prep", &[("cells", json!(8))]);

    let engine = engine(&store);
    let err = engine.probe_node(&node.id).unwrap_err();
    assert!(matches!(err, LifecycleError::NoSubmission { .. }));
  }

  #[tokio::test]
  async fn large_step_output_spills_to_log_file() {
    let (_temp, store) = setup_workspace();
    let mut node = child_node(&store, "prep", &[("cells", json!(8))]);
    node
      .statepoint
      .pre_build
      .push(BuildStep::Shell("seq 1 2000".to_string()));
    let node = store.open(node.statepoint).unwrap();

    let engine = engine(&store);
    assert_eq!(engine.dispatch(&node.id, "prep").await.unwrap(), DispatchOutcome::Completed);

    let node = store.get(&node.id).unwrap();
    let entry = node.document.history.iter().find(|e| e.command == "seq 1 2000").unwrap();
    let LogRef::File(path) = &entry.log else {
      panic!("large output must be spilled to a file");
    };
    assert!(path.exists());
    assert!(std::fs::read_to_string(path).unwrap().contains("2000"));

    // Small outputs stay inline.
    let inline = node.document.history.iter().find(|e| e.command == "prep").unwrap();
    assert!(matches!(inline.log, LogRef::Inline(_)));
  }
}
