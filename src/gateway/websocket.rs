//! Per-connection control channel
//!
//! One reader loop dispatches console frames; one writer task owns the
//! socket's send half. The metrics publisher, every stream producer and
//! every in-flight command hang off the connection's root token, and all of
//! them are awaited before [`run_channel`] returns.

use super::commands::CommandGateway;
use super::multiplexer::{StreamMultiplexer, StreamSettings};
use super::publisher::{MetricsPublisher, PublisherReport};
use super::relay::{Relay, RelayReceiver};
use super::server::AgentServices;
use crate::protocol::{AgentEvent, ConsoleFrame, Envelope, ErrorNotice};
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A frame read from the console, reduced to what the channel cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
    Other,
}

/// Serve one upgraded WebSocket until either side goes away
pub(crate) async fn handle_socket(
    socket: WebSocket,
    services: AgentServices,
    root: CancellationToken,
    peer: String,
) {
    let (sender, receiver) = socket.split();
    let outbound =
        sender.with(|text: String| futures::future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    let inbound = receiver.map(|message| match message {
        Ok(Message::Text(text)) => Inbound::Text(text),
        Ok(Message::Close(_)) => Inbound::Close,
        Ok(_) => Inbound::Other,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket read failed");
            Inbound::Close
        }
    });

    run_channel(services, inbound, outbound, root, peer.clone()).await;
}

/// Run the channel over any frame stream and text sink.
///
/// Returns when the console closes, the inbound stream ends, the writer
/// fails, or `root` is cancelled from outside.
pub async fn run_channel<I, O>(
    services: AgentServices,
    mut inbound: I,
    outbound: O,
    root: CancellationToken,
    peer: String,
) -> PublisherReport
where
    I: Stream<Item = Inbound> + Unpin + Send,
    O: Sink<String> + Unpin + Send + 'static,
    O::Error: Display,
{
    tracing::info!(peer = %peer, "Console connected");

    let agent = &services.agent;
    let (relay, relay_rx) = Relay::channel(agent.control_capacity, agent.stream_capacity);
    let writer = tokio::spawn(write_loop(relay_rx, outbound, root.clone(), peer.clone()));

    let publisher = tokio::spawn(
        MetricsPublisher::new(services.metrics.clone(), agent.metrics_interval())
            .run(relay.clone(), root.child_token()),
    );
    let mux = StreamMultiplexer::new(
        services.logs.clone(),
        services.inspector.clone(),
        relay.clone(),
        root.clone(),
        StreamSettings {
            default_tail: agent.log_tail,
            inspect_timeout: services.timeouts.inspect(),
        },
    );
    let commands = CommandGateway::new(services.executor.clone(), services.timeouts.clone());
    let mut in_flight = JoinSet::new();

    loop {
        let message = tokio::select! {
            _ = root.cancelled() => break,
            message = inbound.next() => message,
        };
        let frame = match message {
            Some(Inbound::Text(text)) => match decode_frame(&text) {
                Ok(frame) => frame,
                Err(notice) => {
                    tracing::warn!(peer = %peer, "{}", notice.message);
                    relay.send_control(AgentEvent::Error(notice)).await;
                    None
                }
            },
            Some(Inbound::Other) => None,
            Some(Inbound::Close) | None => break,
        };
        match frame {
            Some(ConsoleFrame::Start(start)) if start.target_id.is_empty() => {
                relay.send_control(target_required()).await;
            }
            Some(ConsoleFrame::Start(start)) => mux.start(start).await,
            Some(ConsoleFrame::Stop(stop)) if stop.target_id.is_empty() => {
                relay.send_control(target_required()).await;
            }
            Some(ConsoleFrame::Stop(stop)) => mux.stop(&stop.target_id).await,
            Some(ConsoleFrame::Request(request)) => {
                commands.spawn(&mut in_flight, request, relay.clone(), root.child_token());
            }
            None => {}
        }
        reap(&mut in_flight);
    }

    // Single cleanup point: everything below is a child of `root`
    root.cancel();
    mux.shutdown().await;
    let report = match publisher.await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Metrics publisher panicked");
            PublisherReport::default()
        }
    };
    while in_flight.join_next().await.is_some() {}
    drop(relay);
    if let Err(e) = writer.await {
        tracing::warn!(peer = %peer, error = %e, "Channel writer panicked");
    }

    tracing::info!(
        peer = %peer,
        published = report.published,
        skipped = report.skipped,
        "Console disconnected"
    );
    report
}

/// Drop finished command tasks without waiting; runs on every reader pass
fn reap(in_flight: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while in_flight.try_join_next().is_some() {
        reaped += 1;
    }
    reaped
}

fn target_required() -> AgentEvent {
    AgentEvent::Error(ErrorNotice::new("target id required"))
}

/// Decode a text frame. `Ok(None)` for kinds this agent does not handle.
fn decode_frame(text: &str) -> std::result::Result<Option<ConsoleFrame>, ErrorNotice> {
    let envelope = Envelope::decode(text)
        .map_err(|e| ErrorNotice::new(format!("Invalid message format: {}", e)))?;
    match ConsoleFrame::from_envelope(&envelope) {
        Ok(Some(frame)) => Ok(Some(frame)),
        Ok(None) => {
            tracing::debug!(kind = %envelope.kind, "Ignoring unknown envelope kind");
            Ok(None)
        }
        Err(e) => Err(ErrorNotice::new(e.to_string())),
    }
}

/// The only task that writes to the socket
async fn write_loop<O>(mut relay: RelayReceiver, mut outbound: O, root: CancellationToken, peer: String)
where
    O: Sink<String> + Unpin,
    O::Error: Display,
{
    loop {
        let event = tokio::select! {
            _ = root.cancelled() => break,
            event = relay.next() => event,
        };
        let Some(event) = event else { break };

        let kind = event.kind();
        let text = match event.into_envelope().and_then(|env| env.encode()) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(peer = %peer, kind, error = %e, "Dropping unencodable event");
                continue;
            }
        };
        if let Err(e) = outbound.send(text).await {
            tracing::debug!(peer = %peer, error = %e, "Socket write failed, closing channel");
            root.cancel();
            break;
        }
    }
    let _ = outbound.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, CommandTimeouts};
    use crate::protocol::{kind, CommandAction, CommandRequest, StartStream, StreamTarget};
    use crate::testing::{FakeExecutor, FakeInspector, FakeLogs, FakeMetrics};
    use futures::channel::mpsc as fmpsc;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;

    struct Harness {
        inbound: Option<mpsc::Sender<Inbound>>,
        outbound: fmpsc::UnboundedReceiver<String>,
        logs: Arc<FakeLogs>,
        task: JoinHandle<PublisherReport>,
    }

    impl Harness {
        fn start() -> Self {
            let logs = Arc::new(FakeLogs::default());
            let services = AgentServices {
                metrics: Arc::new(FakeMetrics::default()),
                logs: logs.clone(),
                inspector: Arc::new(FakeInspector),
                executor: Arc::new(FakeExecutor::default()),
                agent: AgentConfig {
                    metrics_interval_ms: 60_000,
                    ..Default::default()
                },
                timeouts: CommandTimeouts::default(),
            };
            let (in_tx, in_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = fmpsc::unbounded();
            let task = tokio::spawn(run_channel(
                services,
                ReceiverStream::new(in_rx),
                out_tx,
                CancellationToken::new(),
                "test".to_string(),
            ));
            Self {
                inbound: Some(in_tx),
                outbound: out_rx,
                logs,
                task,
            }
        }

        async fn send(&self, frame: ConsoleFrame) {
            let text = frame.encode().unwrap();
            self.send_raw(&text).await;
        }

        async fn send_raw(&self, text: &str) {
            self.inbound
                .as_ref()
                .unwrap()
                .send(Inbound::Text(text.to_string()))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<Envelope> {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.next())
                .await
                .expect("timed out waiting for a frame")
                .map(|text| Envelope::decode(&text).unwrap())
        }

        /// Skip frames until one of `kind` arrives
        async fn recv_kind(&mut self, wanted: &str) -> Envelope {
            loop {
                let env = self.recv().await.expect("channel closed");
                if env.kind == wanted {
                    return env;
                }
            }
        }
    }

    fn start(target: &str) -> ConsoleFrame {
        ConsoleFrame::Start(StartStream {
            details: false,
            ..StartStream::new(target)
        })
    }

    #[tokio::test]
    async fn test_first_frame_is_metrics() {
        let mut h = Harness::start();
        let env = h.recv().await.unwrap();
        assert_eq!(env.kind, kind::METRICS);
    }

    #[tokio::test]
    async fn test_no_lines_after_stop() {
        let mut h = Harness::start();
        h.send(start("c1")).await;
        let line = h.recv_kind(kind::LOG_LINE).await;
        assert_eq!(line.payload["targetId"], "c1");

        h.send(ConsoleFrame::Stop(StreamTarget::new("c1"))).await;
        let request = CommandRequest::with_key("after-stop", &CommandAction::SystemInfo {}).unwrap();
        h.send(ConsoleFrame::Request(request)).await;

        // The stop is processed before the request, so nothing for c1 may
        // follow the response
        loop {
            let env = h.recv().await.unwrap();
            if env.kind == kind::RESPONSE {
                assert_eq!(env.payload["correlationKey"], "after-stop");
                break;
            }
        }
        let quiet = tokio::time::timeout(Duration::from_millis(100), async {
            while let Some(text) = h.outbound.next().await {
                let env = Envelope::decode(&text).unwrap();
                assert_ne!(env.kind, kind::LOG_LINE, "line after stop: {}", text);
            }
        })
        .await;
        assert!(quiet.is_err());
        assert_eq!(h.logs.live(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_everything() {
        let mut h = Harness::start();
        h.send(start("c1")).await;
        h.send(start("c2")).await;
        let slow = CommandRequest::with_key(
            "slow",
            &CommandAction::Exec {
                command: "sleep 60000".to_string(),
            },
        )
        .unwrap();
        h.send(ConsoleFrame::Request(slow)).await;
        h.recv_kind(kind::LOG_LINE).await;

        h.inbound.as_ref().unwrap().send(Inbound::Close).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), &mut h.task)
            .await
            .expect("channel did not shut down")
            .unwrap();

        assert_eq!(h.logs.live(), 0);
        // Writer is gone; whatever was flushed holds no response
        while let Some(text) = h.outbound.next().await {
            assert_ne!(Envelope::decode(&text).unwrap().kind, kind::RESPONSE);
        }
    }

    #[tokio::test]
    async fn test_inbound_end_is_a_close() {
        let mut h = Harness::start();
        h.send(start("c1")).await;
        h.recv_kind(kind::LOG_LINE).await;
        h.inbound.take();
        tokio::time::timeout(Duration::from_secs(2), &mut h.task)
            .await
            .expect("channel did not shut down")
            .unwrap();
        assert_eq!(h.logs.live(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported_not_fatal() {
        let mut h = Harness::start();
        h.send_raw("{ not json").await;
        let env = h.recv_kind(kind::ERROR).await;
        assert!(env.payload["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid message format"));

        h.send_raw(r#"{"kind":"start","payload":{}}"#).await;
        let env = h.recv_kind(kind::ERROR).await;
        assert_eq!(env.payload["message"], "target id required");

        h.send_raw(r#"{"kind":"subscribeGpu","payload":{}}"#).await;
        let request = CommandRequest::with_key("k1", &CommandAction::ListContainers {}).unwrap();
        h.send(ConsoleFrame::Request(request)).await;
        let env = h.recv_kind(kind::RESPONSE).await;
        assert_eq!(env.payload["correlationKey"], "k1");
        assert!(env.payload.get("ok").is_some());
    }

    #[tokio::test]
    async fn test_reap_keeps_running_commands() {
        let mut in_flight = JoinSet::new();
        in_flight.spawn(async {});
        in_flight.spawn(async {});
        in_flight.spawn(std::future::pending::<()>());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(reap(&mut in_flight), 2);
        assert_eq!(in_flight.len(), 1);
        assert_eq!(reap(&mut in_flight), 0);
        in_flight.abort_all();
    }

    #[tokio::test]
    async fn test_multibyte_garbage_keeps_channel_open() {
        let mut h = Harness::start();
        h.send_raw(&format!("{}é and more", "x".repeat(119))).await;
        let env = h.recv_kind(kind::ERROR).await;
        assert!(env.payload["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid message format"));

        let request = CommandRequest::with_key("k2", &CommandAction::SystemInfo {}).unwrap();
        h.send(ConsoleFrame::Request(request)).await;
        let env = h.recv_kind(kind::RESPONSE).await;
        assert_eq!(env.payload["correlationKey"], "k2");
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn test_writer_failure_closes_channel() {
        let h = Harness::start();
        let Harness {
            inbound,
            outbound,
            task,
            ..
        } = h;
        drop(outbound);
        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("channel did not shut down")
            .unwrap();
        assert_eq!(report.published, 1);
        drop(inbound);
    }
}
