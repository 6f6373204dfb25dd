//! Named, independently cancellable log streams over one channel

use super::relay::Relay;
use crate::collect::{LogOptions, LogSource, ResourceInspector};
use crate::protocol::{AgentEvent, ErrorNotice, LogLine, StartStream, StreamEnd, TargetDetails};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reason sent in `streamEnd` when the source runs dry
pub const END_COMPLETED: &str = "completed";
/// Reason sent in `streamEnd` when the source fails mid-stream
pub const END_FAILED: &str = "failed";

struct ActiveStream {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Settings shared by every producer of a multiplexer
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Historical lines when a start frame does not name a tail
    pub default_tail: u32,
    /// Bound on the `containerDetails` lookup
    pub inspect_timeout: Duration,
}

struct Shared {
    logs: Arc<dyn LogSource>,
    inspector: Arc<dyn ResourceInspector>,
    relay: Relay,
    root: CancellationToken,
    settings: StreamSettings,
    streams: Mutex<HashMap<String, ActiveStream>>,
    generation: AtomicU64,
}

/// Maps target ids to their running producer.
///
/// At most one producer exists per target. Every producer token is a child
/// of the connection's root token.
#[derive(Clone)]
pub struct StreamMultiplexer {
    shared: Arc<Shared>,
}

impl StreamMultiplexer {
    pub fn new(
        logs: Arc<dyn LogSource>,
        inspector: Arc<dyn ResourceInspector>,
        relay: Relay,
        root: CancellationToken,
        settings: StreamSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                logs,
                inspector,
                relay,
                root,
                settings,
                streams: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start streaming `request.target_id`, replacing any producer already
    /// running for it. Returns once the previous producer has exited.
    pub async fn start(&self, request: StartStream) {
        let target = request.target_id.clone();
        loop {
            let previous = self.shared.streams.lock().await.remove(&target);
            if let Some(previous) = previous {
                tracing::debug!(target_id = %target, "Restarting stream, cancelling previous producer");
                previous.cancel.cancel();
                let _ = previous.task.await;
            }

            let mut streams = self.shared.streams.lock().await;
            if streams.contains_key(&target) {
                // A concurrent start won the slot; replace it too
                continue;
            }
            if self.shared.root.is_cancelled() {
                return;
            }

            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let cancel = self.shared.root.child_token();
            let task = tokio::spawn(produce(
                self.shared.clone(),
                request.clone(),
                generation,
                cancel.clone(),
            ));
            streams.insert(
                target.clone(),
                ActiveStream {
                    generation,
                    cancel,
                    task,
                },
            );
            tracing::info!(target_id = %target, generation, "Log stream started");
            return;
        }
    }

    /// Stop the producer for `target`. Unknown targets are ignored.
    pub async fn stop(&self, target: &str) {
        let previous = self.shared.streams.lock().await.remove(target);
        match previous {
            Some(previous) => {
                previous.cancel.cancel();
                let _ = previous.task.await;
                tracing::info!(target_id = %target, "Log stream stopped");
            }
            None => tracing::debug!(target_id = %target, "Stop for inactive stream ignored"),
        }
    }

    /// Targets with a running producer, sorted
    pub async fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.shared.streams.lock().await.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Cancel every producer and wait for all of them
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ActiveStream)> =
            self.shared.streams.lock().await.drain().collect();
        for (_, stream) in &drained {
            stream.cancel.cancel();
        }
        for (target, stream) in drained {
            if let Err(e) = stream.task.await {
                tracing::warn!(target_id = %target, error = %e, "Stream producer panicked");
            }
        }
    }
}

async fn produce(shared: Arc<Shared>, request: StartStream, generation: u64, cancel: CancellationToken) {
    let target = request.target_id.clone();
    let stream_id = request.stream_id;
    let relay = &shared.relay;

    if request.details {
        let details = tokio::select! {
            _ = cancel.cancelled() => return,
            details = tokio::time::timeout(
                shared.settings.inspect_timeout,
                shared.inspector.describe(&target),
            ) => details,
        };
        let event = match details {
            Ok(Ok(details)) => AgentEvent::ContainerDetails(TargetDetails {
                target_id: target.clone(),
                stream_id,
                details,
            }),
            Ok(Err(e)) => AgentEvent::Error(
                ErrorNotice::for_target(&target, e.to_string()).in_stream(stream_id),
            ),
            Err(_) => AgentEvent::Error(
                ErrorNotice::for_target(
                    &target,
                    format!(
                        "inspect timed out after {}ms",
                        shared.settings.inspect_timeout.as_millis()
                    ),
                )
                .in_stream(stream_id),
            ),
        };
        // A full control lane must not outlive a stop
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = relay.send_control(event) => if !sent {
                return;
            },
        }
    }

    let options = LogOptions {
        follow: request.follow,
        tail: request.tail.unwrap_or(shared.settings.default_tail),
        timestamps: true,
    };
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = shared.logs.follow(&target, &options, cancel.clone()) => opened,
    };

    let reason = match opened {
        Ok(mut lines) => loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = lines.next() => next,
            };
            match next {
                Some(Ok(line)) => {
                    let event = AgentEvent::LogLine(LogLine {
                        target_id: target.clone(),
                        stream_id,
                        line,
                    });
                    if !relay.send_stream(event, Some(&cancel)).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(target_id = %target, error = %e, "Log source failed");
                    let notice = AgentEvent::Error(
                        ErrorNotice::for_target(&target, e.to_string()).in_stream(stream_id),
                    );
                    relay.send_stream(notice, Some(&cancel)).await;
                    break END_FAILED;
                }
                None => break END_COMPLETED,
            }
        },
        Err(e) => {
            tracing::warn!(target_id = %target, error = %e, "Failed to open log source");
            let notice = AgentEvent::Error(
                ErrorNotice::for_target(&target, e.to_string()).in_stream(stream_id),
            );
            relay.send_stream(notice, Some(&cancel)).await;
            END_FAILED
        }
    };

    // Natural end: the line stream has been dropped above
    let end = AgentEvent::StreamEnd(StreamEnd {
        target_id: target.clone(),
        stream_id,
        reason: reason.to_string(),
    });
    relay.send_stream(end, Some(&cancel)).await;

    let mut streams = shared.streams.lock().await;
    if streams.get(&target).map(|s| s.generation) == Some(generation) {
        streams.remove(&target);
    }
    tracing::info!(target_id = %target, reason, "Log stream ended");
}
