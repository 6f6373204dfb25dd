//! Default command executor for the agent host

use super::types::CommandOutput;
use super::updates::PackageUpdater;
use super::{CommandExecutor, DockerCli, MetricsSource, ResourceInspector};
use crate::error::Result;
use crate::protocol::CommandAction;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

/// Run `program` to completion and capture its output.
///
/// A program that cannot be started still yields an output with exit code
/// `-1`; only the caller's deadline turns it into an error.
pub(super) async fn run_program<I, S>(program: &str, args: I) -> CommandOutput
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let started = Instant::now();
    let result = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    let duration = started.elapsed().as_millis() as u64;

    match result {
        Ok(output) => CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration,
        },
        Err(e) => CommandOutput {
            stdout: String::new(),
            stderr: e.to_string(),
            exit_code: -1,
            duration,
        },
    }
}

/// Runs `exec` through a shell and delegates container, host and package
/// actions
pub struct HostExecutor {
    shell: String,
    docker: DockerCli,
    metrics: Arc<dyn MetricsSource>,
    updates: PackageUpdater,
}

impl HostExecutor {
    pub fn new(shell: impl Into<String>, docker: DockerCli, metrics: Arc<dyn MetricsSource>) -> Self {
        Self {
            shell: shell.into(),
            docker,
            metrics,
            updates: PackageUpdater::detect(),
        }
    }

    /// Replace the detected package manager
    pub fn with_updater(mut self, updates: PackageUpdater) -> Self {
        self.updates = updates;
        self
    }

    /// Run `command` under `<shell> -c`
    pub async fn exec(&self, command: &str) -> CommandOutput {
        run_program(&self.shell, ["-c", command]).await
    }
}

#[async_trait]
impl CommandExecutor for HostExecutor {
    async fn run(&self, action: &CommandAction) -> Result<serde_json::Value> {
        let value = match action {
            CommandAction::Exec { command } => serde_json::to_value(self.exec(command).await)?,
            CommandAction::Inspect { target_id } => {
                serde_json::to_value(self.docker.describe(target_id).await?)?
            }
            CommandAction::StartContainer { target_id } => {
                self.docker.start(target_id).await?;
                serde_json::json!({ "targetId": target_id, "status": "started" })
            }
            CommandAction::StopContainer { target_id } => {
                self.docker.stop(target_id).await?;
                serde_json::json!({ "targetId": target_id, "status": "stopped" })
            }
            CommandAction::SystemInfo {} => serde_json::to_value(self.metrics.system_info().await?)?,
            CommandAction::ListContainers {} => serde_json::to_value(self.docker.list().await?)?,
            CommandAction::ListUpdates {} => serde_json::to_value(self.updates.list().await?)?,
            CommandAction::ApplyUpdate { package } => {
                serde_json::to_value(self.updates.apply(package).await?)?
            }
            CommandAction::ApplyAllUpdates {} => {
                serde_json::to_value(self.updates.apply_all().await?)?
            }
        };
        Ok(value)
    }
}
