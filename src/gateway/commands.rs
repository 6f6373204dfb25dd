//! One-shot command execution with exactly one correlated response

use super::relay::Relay;
use crate::collect::CommandExecutor;
use crate::config::CommandTimeouts;
use crate::protocol::{AgentEvent, CommandAction, CommandRequest, CommandResponse, FailureKind};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs command requests against the executor, bounded per action
#[derive(Clone)]
pub struct CommandGateway {
    executor: Arc<dyn CommandExecutor>,
    timeouts: CommandTimeouts,
}

impl CommandGateway {
    pub fn new(executor: Arc<dyn CommandExecutor>, timeouts: CommandTimeouts) -> Self {
        Self { executor, timeouts }
    }

    /// Execute a request and build its response. Never fails: every problem
    /// becomes an error outcome.
    pub async fn execute(&self, request: CommandRequest) -> CommandResponse {
        let key = request.correlation_key.clone();

        let action = match request.parse_action() {
            Ok(action) => action,
            Err(e) => {
                let kind = if CommandAction::NAMES.contains(&request.action.as_str()) {
                    FailureKind::InvalidRequest
                } else {
                    FailureKind::Unsupported
                };
                return CommandResponse::failure(key, kind, e.to_string());
            }
        };
        if let Err(message) = action.validate() {
            return CommandResponse::failure(key, FailureKind::InvalidRequest, message);
        }

        let deadline = self.timeouts.for_action(&action);
        let started = std::time::Instant::now();
        let response = match tokio::time::timeout(deadline, self.executor.run(&action)).await {
            Ok(Ok(result)) => CommandResponse::success(key, result),
            Ok(Err(e)) => CommandResponse::failure(key, FailureKind::Failed, e.to_string()),
            Err(_) => CommandResponse::failure(
                key,
                FailureKind::Timeout,
                format!("{} timed out after {}s", action.name(), deadline.as_secs_f64()),
            ),
        };

        tracing::debug!(
            action = action.name(),
            correlation_key = %request.correlation_key,
            ok = response.error.is_none(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        response
    }

    /// Run `request` in its own task on `tasks`, writing the response to
    /// the control lane. Cancelling `cancel` abandons the command silently.
    pub fn spawn(
        &self,
        tasks: &mut JoinSet<()>,
        request: CommandRequest,
        relay: Relay,
        cancel: CancellationToken,
    ) {
        let gateway = self.clone();
        tasks.spawn(async move {
            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = gateway.execute(request) => response,
            };
            relay.send_control(AgentEvent::Response(response)).await;
        });
    }
}
