//! External command execution with captured output and a bounded timeout.
//!
//! Inline operations run through [`CommandRunner::run`], which waits for the
//! command and captures merged stdout+stderr. Terminal solver runs go
//! through [`CommandRunner::spawn_detached`] instead: the process is handed
//! off with its output redirected to a log file and the orchestrator never
//! waits for it.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RunnerError {
  #[error("empty command line")]
  EmptyCommand,

  #[error("failed to spawn '{cmd}': {source}")]
  Spawn {
    cmd: String,
    #[source]
    source: io::Error,
  },

  #[error("command '{cmd}' timed out after {secs}s")]
  Timeout { cmd: String, secs: u64 },

  #[error("failed to open log file {path}: {source}")]
  LogFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Captured result of one finished command.
#[derive(Debug)]
pub struct CommandOutput {
  /// Merged stdout and stderr.
  pub combined: String,
  pub code: Option<i32>,
  pub success: bool,
}

/// Runs external commands for the lifecycle engine.
#[derive(Debug, Clone)]
pub struct CommandRunner {
  timeout: Duration,
}

impl CommandRunner {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  /// Run an argv command in a case directory, waiting up to the timeout.
  ///
  /// A non-zero exit is not an error here; callers read
  /// [`CommandOutput::success`] and record the outcome in the history
  /// ledger. Only spawn failures and timeouts surface as errors.
  pub async fn run(&self, argv: &[String], cwd: &Path) -> Result<CommandOutput, RunnerError> {
    let Some((program, args)) = argv.split_first() else {
      return Err(RunnerError::EmptyCommand);
    };
    let cmd = argv.join(" ");
    info!(cmd = %cmd, cwd = %cwd.display(), "executing command");

    let mut command = Command::new(program);
    command.args(args).current_dir(cwd);

    let output = tokio::time::timeout(self.timeout, command.output())
      .await
      .map_err(|_| RunnerError::Timeout {
        cmd: cmd.clone(),
        secs: self.timeout.as_secs(),
      })?
      .map_err(|e| RunnerError::Spawn { cmd, source: e })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    debug!(code = ?output.status.code(), bytes = combined.len(), "command finished");
    Ok(CommandOutput {
      combined,
      code: output.status.code(),
      success: output.status.success(),
    })
  }

  /// Run a free-form shell command line through the platform shell.
  pub async fn run_shell(&self, cmd: &str, cwd: &Path) -> Result<CommandOutput, RunnerError> {
    self.run(&shell_argv(cmd), cwd).await
  }

  /// Hand a terminal command off for out-of-process execution.
  ///
  /// Stdout and stderr go to the log file; the child is not awaited. The
  /// caller records only that the step started, and a later probe of the
  /// log decides the final state.
  pub fn spawn_detached(&self, argv: &[String], cwd: &Path, log_path: &Path) -> Result<u32, RunnerError> {
    let Some((program, args)) = argv.split_first() else {
      return Err(RunnerError::EmptyCommand);
    };
    let cmd = argv.join(" ");

    let log = File::create(log_path).map_err(|e| RunnerError::LogFile {
      path: log_path.to_path_buf(),
      source: e,
    })?;
    let log_err = log.try_clone().map_err(|e| RunnerError::LogFile {
      path: log_path.to_path_buf(),
      source: e,
    })?;

    let child = std::process::Command::new(program)
      .args(args)
      .current_dir(cwd)
      .stdin(std::process::Stdio::null())
      .stdout(log)
      .stderr(log_err)
      .spawn()
      .map_err(|e| RunnerError::Spawn { cmd: cmd.clone(), source: e })?;

    let pid = child.id();
    info!(cmd = %cmd, pid = pid, log = %log_path.display(), "handed off for out-of-process execution");
    Ok(pid)
  }
}

/// Argv for the platform shell. `/bin/sh` is used directly rather than the
/// user's configured shell so profile files cannot leak state into steps.
pub(crate) fn shell_argv(cmd: &str) -> Vec<String> {
  #[cfg(unix)]
  {
    vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()]
  }

  #[cfg(windows)]
  {
    vec![
      "powershell.exe".to_string(),
      "-NoProfile".to_string(),
      "-Command".to_string(),
      cmd.to_string(),
    ]
  }
}
