//! Two-lane outbound relay feeding the single socket writer

use crate::protocol::AgentEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An event on the stream lane, tied to the producer that emitted it
struct Guarded {
    event: AgentEvent,
    guard: Option<CancellationToken>,
}

/// Sending side, cloned into every task of a connection.
///
/// The control lane carries command responses, untargeted errors and
/// container details. The stream lane carries metrics, log lines and the
/// trailing notices of a producer. Both lanes are bounded; a full lane
/// blocks the sender.
#[derive(Clone)]
pub struct Relay {
    control: mpsc::Sender<AgentEvent>,
    stream: mpsc::Sender<Guarded>,
}

/// Receiving side, owned by the writer task
pub struct RelayReceiver {
    control: mpsc::Receiver<AgentEvent>,
    stream: mpsc::Receiver<Guarded>,
}

impl Relay {
    pub fn channel(control_capacity: usize, stream_capacity: usize) -> (Relay, RelayReceiver) {
        let (control_tx, control_rx) = mpsc::channel(control_capacity);
        let (stream_tx, stream_rx) = mpsc::channel(stream_capacity);
        (
            Relay {
                control: control_tx,
                stream: stream_tx,
            },
            RelayReceiver {
                control: control_rx,
                stream: stream_rx,
            },
        )
    }

    /// Queue a control event. Returns `false` once the writer is gone.
    pub async fn send_control(&self, event: AgentEvent) -> bool {
        self.control.send(event).await.is_ok()
    }

    /// Queue a stream event on behalf of the producer owning `guard`.
    ///
    /// Gives up without queueing if `guard` is cancelled while waiting for
    /// capacity. An event queued under a guard that is cancelled before the
    /// writer reaches it is discarded.
    pub async fn send_stream(&self, event: AgentEvent, guard: Option<&CancellationToken>) -> bool {
        let item = Guarded {
            event,
            guard: guard.cloned(),
        };
        match guard {
            Some(guard) => tokio::select! {
                biased;
                _ = guard.cancelled() => false,
                sent = self.stream.send(item) => sent.is_ok(),
            },
            None => self.stream.send(item).await.is_ok(),
        }
    }
}

impl RelayReceiver {
    /// Next event to write, preferring the control lane.
    ///
    /// Returns `None` once every [`Relay`] has been dropped and both lanes
    /// are drained.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        loop {
            let item = tokio::select! {
                biased;
                Some(event) = self.control.recv() => return Some(event),
                Some(item) = self.stream.recv() => item,
                else => return None,
            };
            if item.guard.as_ref().is_some_and(CancellationToken::is_cancelled) {
                continue;
            }
            return Some(item.event);
        }
    }
}
