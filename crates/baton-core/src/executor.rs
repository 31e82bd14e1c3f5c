//! Local step execution.
//!
//! The engine owns scheduling; what "running a check" means is behind the
//! [`LocalExecutor`] trait. [`ShellExecutor`] runs each check as a shell
//! command in the repository root.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;

use crate::workflow::LocalAction;

/// Result of a local action.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOutcome {
    pub success: bool,
    pub output: String,
}

impl LocalOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Run `action` for `step`. Failures are reported in the outcome, not raised.
    async fn run(&self, step: &str, action: &LocalAction) -> LocalOutcome;
}

/// Runs checks with `sh -c`.
///
/// The command is the action's inline `command`, or else the entry in the
/// configured `checks` table named by `action.check`.
pub struct ShellExecutor {
    workdir: PathBuf,
    checks: HashMap<String, String>,
}

impl ShellExecutor {
    pub fn new(workdir: impl Into<PathBuf>, checks: HashMap<String, String>) -> Self {
        Self {
            workdir: workdir.into(),
            checks,
        }
    }

    fn command_for<'a>(&'a self, action: &'a LocalAction) -> Option<&'a str> {
        action
            .command
            .as_deref()
            .or_else(|| self.checks.get(&action.check).map(String::as_str))
    }
}

#[async_trait]
impl LocalExecutor for ShellExecutor {
    async fn run(&self, step: &str, action: &LocalAction) -> LocalOutcome {
        let Some(command) = self.command_for(action) else {
            return LocalOutcome::failed(format!(
                "no command configured for check '{}'",
                action.check
            ));
        };

        tracing::info!("[Executor] {} → sh -c {:?}", step, command);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => {
                let combined = String::from_utf8_lossy(&output.stdout).to_string()
                    + &String::from_utf8_lossy(&output.stderr);
                if output.status.success() {
                    LocalOutcome::succeeded(combined)
                } else {
                    tracing::warn!("[Executor] {} exited with {}", step, output.status);
                    LocalOutcome::failed(combined)
                }
            }
            Err(e) => LocalOutcome::failed(format!("failed to spawn `{}`: {}", command, e)),
        }
    }
}
