//! Command serialization queue
//!
//! Operations that need exclusive use of a host run one at a time, in the
//! order they were submitted. A single worker task drains a bounded FIFO;
//! a failed command never blocks the ones behind it.

use super::connection::Connection;
use crate::error::CommandError;
use crate::protocol::CommandAction;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Reply = std::result::Result<serde_json::Value, CommandError>;

/// Something that can run a command round trip
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn request(&self, action: CommandAction) -> Reply;
}

#[async_trait]
impl CommandChannel for Connection {
    async fn request(&self, action: CommandAction) -> Reply {
        Connection::request(self, action).await
    }
}

struct Job {
    channel: Arc<dyn CommandChannel>,
    action: CommandAction,
    submitted: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Outcome of one submission
pub struct CommandTicket {
    action: &'static str,
    reply: oneshot::Receiver<Reply>,
}

impl CommandTicket {
    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Wait for the command's turn and its round trip
    pub async fn wait(self) -> Reply {
        self.reply.await.unwrap_or(Err(CommandError::QueueClosed))
    }
}

pub struct CommandQueue {
    jobs: mpsc::Sender<Job>,
    closing: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn new(depth: usize) -> Self {
        let (jobs, rx) = mpsc::channel(depth.max(1));
        let closing = CancellationToken::new();
        let worker = tokio::spawn(work(rx, closing.clone()));
        Self {
            jobs,
            closing,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue `action` on `channel`. Its place in line is fixed here.
    pub fn submit(
        &self,
        channel: Arc<dyn CommandChannel>,
        action: CommandAction,
    ) -> std::result::Result<CommandTicket, CommandError> {
        let name = action.name();
        let (reply, rx) = oneshot::channel();
        let job = Job {
            channel,
            action,
            submitted: Instant::now(),
            reply,
        };
        match self.jobs.try_send(job) {
            Ok(()) => Ok(CommandTicket {
                action: name,
                reply: rx,
            }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(action = name, "Command queue full");
                Err(CommandError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommandError::QueueClosed),
        }
    }

    /// Submit and wait
    pub async fn run(&self, channel: Arc<dyn CommandChannel>, action: CommandAction) -> Reply {
        self.submit(channel, action)?.wait().await
    }

    /// Stop the worker. The command in flight and everything queued
    /// resolve with [`CommandError::QueueClosed`].
    pub async fn close(&self) {
        self.closing.cancel();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

async fn work(mut jobs: mpsc::Receiver<Job>, closing: CancellationToken) {
    loop {
        let job = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            job = jobs.recv() => job,
        };
        let Some(job) = job else { break };

        let name = job.action.name();
        if job.reply.is_closed() {
            tracing::debug!(action = name, "Skipping abandoned command");
            continue;
        }
        let waited_ms = job.submitted.elapsed().as_millis() as u64;
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = closing.cancelled() => Err(CommandError::QueueClosed),
            outcome = job.channel.request(job.action) => outcome,
        };
        match &outcome {
            Ok(_) => tracing::debug!(
                action = name,
                waited_ms,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Command completed"
            ),
            Err(e) => tracing::warn!(action = name, error = %e, "Command failed"),
        }
        let _ = job.reply.send(outcome);
    }
    jobs.close();
    tracing::debug!("Command queue stopped");
}
