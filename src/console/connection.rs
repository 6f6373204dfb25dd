//! One console-side connection to an agent
//!
//! A [`Connection`] owns at most one live link. Its reader task is the only
//! consumer of the link: it fans metrics, stream events and errors out to
//! bounded subscriber queues and resolves pending commands by correlation
//! key. Every transition bumps or checks a generation counter so that work
//! belonging to a superseded link or attempt can never touch current state.

use super::host::HostAddr;
use super::transport::{Connector, FrameSink, Link, TransportEvent};
use crate::collect::{ContainerDetails, MetricsSnapshot};
use crate::config::{CommandTimeouts, ServerTuiConfig};
use crate::error::{CommandError, ConnectFailure, ConnectionError, Error, Result};
use crate::protocol::{
    AgentEvent, CommandAction, CommandRequest, ConsoleFrame, Envelope, ErrorNotice, HealthReport,
    StartStream, StreamTarget,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Frames buffered between callers and the link writer
const OUTBOUND_CAPACITY: usize = 64;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initial, and after an explicit disconnect
    Disconnected,
    /// Handshake and health check in flight
    Connecting,
    /// Link up and healthy
    Connected,
    /// Last attempt or link failed; stays here until `connect()` is retried
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Settings shared by every connection of a console
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub subscriber_capacity: usize,
    pub timeouts: CommandTimeouts,
    /// Added to the agent-side deadline before a round trip is abandoned
    pub response_grace: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerTuiConfig) -> Self {
        Self {
            connect_timeout: config.console.connect_timeout(),
            subscriber_capacity: config.console.subscriber_capacity,
            timeouts: config.commands.clone(),
            response_grace: config.console.response_grace(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerTuiConfig::default())
    }
}

/// Event delivered on a log stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Details(ContainerDetails),
    Line(String),
    /// A targeted error; the stream may continue
    Error(String),
    /// The agent ended the stream; no further events follow
    Ended(String),
}

type Outcome = std::result::Result<(), ConnectionError>;
type Attempt = Shared<BoxFuture<'static, Outcome>>;
type Reply = std::result::Result<serde_json::Value, CommandError>;

/// Metrics ticks for one subscriber
pub type MetricsFeed = ReceiverStream<MetricsSnapshot>;
/// Untargeted agent errors for one subscriber
pub type ErrorFeed = ReceiverStream<ErrorNotice>;

struct Live {
    generation: u64,
    outbound: mpsc::Sender<String>,
    closing: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    health: HealthReport,
}

struct StreamSlot {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

struct PendingCommand {
    action: &'static str,
    issued: Instant,
    reply: oneshot::Sender<Reply>,
}

struct Inner {
    state: ConnectionState,
    last_error: Option<ConnectionError>,
    generation: u64,
    attempt: Option<Attempt>,
    live: Option<Live>,
    metrics: Vec<mpsc::Sender<MetricsSnapshot>>,
    errors: Vec<mpsc::Sender<ErrorNotice>>,
    streams: HashMap<String, StreamSlot>,
    pending: HashMap<String, PendingCommand>,
    next_stream_id: u64,
}

impl Inner {
    /// End every subscription and fail every pending command
    fn cascade(&mut self) {
        self.metrics.clear();
        self.errors.clear();
        self.streams.clear();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(CommandError::ConnectionClosed));
        }
    }
}

struct SharedState {
    host: HostAddr,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SharedState {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            tracing::info!(host = %self.host, from = %inner.state, to = %state, "Connection state changed");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }
}

/// Handle to the connection for one host. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<SharedState>,
}

impl Connection {
    pub fn new(host: HostAddr, connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(SharedState {
                host,
                connector,
                settings,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    last_error: None,
                    generation: 0,
                    attempt: None,
                    live: None,
                    metrics: Vec::new(),
                    errors: Vec::new(),
                    streams: HashMap::new(),
                    pending: HashMap::new(),
                    next_stream_id: 0,
                }),
                state_tx,
            }),
        }
    }

    pub fn host(&self) -> &HostAddr {
        &self.shared.host
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Cause of the last failed attempt or broken link
    pub async fn last_error(&self) -> Option<ConnectionError> {
        self.shared.inner.lock().await.last_error.clone()
    }

    /// Health report of the live link
    pub async fn health(&self) -> Option<HealthReport> {
        self.shared
            .inner
            .lock()
            .await
            .live
            .as_ref()
            .map(|live| live.health.clone())
    }

    /// Connect if not already connected.
    ///
    /// Concurrent callers share the single in-flight attempt and all see
    /// its outcome.
    pub async fn connect(&self) -> Outcome {
        match self.begin_connect().await {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }

    /// Start an attempt unless connected or one is in flight.
    /// `None` means already connected.
    pub(crate) async fn begin_connect(&self) -> Option<Attempt> {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            ConnectionState::Connected => return None,
            ConnectionState::Connecting => {
                if let Some(attempt) = &inner.attempt {
                    return Some(attempt.clone());
                }
            }
            ConnectionState::Disconnected | ConnectionState::Error => {}
        }

        inner.generation += 1;
        let generation = inner.generation;
        self.shared.set_state(&mut inner, ConnectionState::Connecting);

        let host = self.shared.host.to_string();
        let task = tokio::spawn(handshake(self.shared.clone(), generation));
        let attempt = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ConnectionError::new(
                    host,
                    ConnectFailure::Transport(format!("handshake task failed: {}", e)),
                )),
            }
        }
        .boxed()
        .shared();
        inner.attempt = Some(attempt.clone());
        Some(attempt)
    }

    /// Tear down the link and every subscription. Always safe.
    ///
    /// An attempt in flight resolves with [`ConnectFailure::Aborted`].
    pub async fn disconnect(&self) {
        let live = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            inner.attempt = None;
            let live = inner.live.take();
            inner.cascade();
            self.shared.set_state(&mut inner, ConnectionState::Disconnected);
            live
        };

        if let Some(live) = live {
            live.closing.cancel();
            let _ = live.writer.await;
            let _ = live.reader.await;
            tracing::debug!(host = %self.shared.host, "Link released");
        }
    }

    /// Receive every metrics tick while connected
    pub async fn subscribe_metrics(&self) -> Result<MetricsFeed> {
        let (tx, rx) = mpsc::channel(self.shared.settings.subscriber_capacity);
        let mut inner = self.shared.inner.lock().await;
        if inner.live.is_none() {
            return Err(CommandError::NotConnected.into());
        }
        inner.metrics.push(tx);
        Ok(ReceiverStream::new(rx))
    }

    /// Receive untargeted agent errors while connected
    pub async fn subscribe_errors(&self) -> Result<ErrorFeed> {
        let (tx, rx) = mpsc::channel(self.shared.settings.subscriber_capacity);
        let mut inner = self.shared.inner.lock().await;
        if inner.live.is_none() {
            return Err(CommandError::NotConnected.into());
        }
        inner.errors.push(tx);
        Ok(ReceiverStream::new(rx))
    }

    /// Ask the agent to stream `request.target_id`.
    ///
    /// A previous stream for the same target ends. Dropping the returned
    /// stream sends `stop` for it. The start frame carries the stream's id,
    /// and events echoing another id are dropped.
    pub async fn stream_logs(&self, mut request: StartStream) -> Result<LogStream> {
        let target = request.target_id.clone();
        if target.is_empty() {
            return Err(Error::Protocol("target id required".to_string()));
        }
        let (tx, rx) = mpsc::channel(self.shared.settings.subscriber_capacity);

        let (id, frame, outbound) = {
            let mut inner = self.shared.inner.lock().await;
            let outbound = match &inner.live {
                Some(live) => live.outbound.clone(),
                None => return Err(CommandError::NotConnected.into()),
            };
            let id = inner.next_stream_id + 1;
            request.stream_id = Some(id);
            let frame = ConsoleFrame::Start(request).encode()?;
            inner.next_stream_id = id;
            inner.streams.insert(target.clone(), StreamSlot { id, tx });
            (id, frame, outbound)
        };

        if outbound.send(frame).await.is_err() {
            self.release_stream(&target, id, false).await;
            return Err(CommandError::ConnectionClosed.into());
        }
        tracing::debug!(host = %self.shared.host, target_id = %target, "Log stream requested");

        Ok(LogStream {
            target,
            id,
            events: ReceiverStream::new(rx),
            connection: Some(self.clone()),
        })
    }

    /// Remove the slot if it still belongs to stream `id`, optionally
    /// telling the agent to stop
    async fn release_stream(&self, target: &str, id: u64, send_stop: bool) {
        let outbound = {
            let mut inner = self.shared.inner.lock().await;
            if inner.streams.get(target).map(|s| s.id) != Some(id) {
                return;
            }
            inner.streams.remove(target);
            inner.live.as_ref().map(|live| live.outbound.clone())
        };

        if let (true, Some(outbound)) = (send_stop, outbound) {
            match ConsoleFrame::Stop(StreamTarget::new(target)).encode() {
                Ok(frame) => {
                    let _ = outbound.send(frame).await;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode stop frame"),
            }
        }
    }

    /// Send a command and wait for its correlated response.
    ///
    /// Bounded by the action's timeout plus the response grace. A command
    /// in flight when the link goes away fails with
    /// [`CommandError::ConnectionClosed`].
    pub async fn request(&self, action: CommandAction) -> std::result::Result<serde_json::Value, CommandError> {
        let request =
            CommandRequest::new(&action).map_err(|e| CommandError::Transport(e.to_string()))?;
        let key = request.correlation_key.clone();
        let frame = ConsoleFrame::Request(request)
            .encode()
            .map_err(|e| CommandError::Transport(e.to_string()))?;

        let (reply, response) = oneshot::channel();
        let outbound = {
            let mut inner = self.shared.inner.lock().await;
            let outbound = match &inner.live {
                Some(live) => live.outbound.clone(),
                None => return Err(CommandError::NotConnected),
            };
            inner.pending.insert(
                key.clone(),
                PendingCommand {
                    action: action.name(),
                    issued: Instant::now(),
                    reply,
                },
            );
            outbound
        };

        if outbound.send(frame).await.is_err() {
            self.shared.inner.lock().await.pending.remove(&key);
            return Err(CommandError::ConnectionClosed);
        }

        let deadline = self.shared.settings.timeouts.for_action(&action)
            + self.shared.settings.response_grace;
        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::ConnectionClosed),
            Err(_) => {
                self.shared.inner.lock().await.pending.remove(&key);
                tracing::warn!(
                    host = %self.shared.host,
                    action = action.name(),
                    correlation_key = %key,
                    "Command timed out waiting for a response"
                );
                Err(CommandError::Timeout {
                    action: action.name().to_string(),
                    after: deadline,
                })
            }
        }
    }
}

/// Open the link, check health, and install the link if this attempt is
/// still current
async fn handshake(shared: Arc<SharedState>, generation: u64) -> Outcome {
    let host = shared.host.clone();
    let limit = shared.settings.connect_timeout;
    tracing::info!(host = %host, "Connecting");

    let opened = tokio::time::timeout(limit, async {
        let link = shared.connector.open(&host).await?;
        let health = shared.connector.health(&host).await?;
        Ok::<_, ConnectFailure>((link, health))
    })
    .await
    .unwrap_or(Err(ConnectFailure::Timeout(limit)));

    let mut inner = shared.inner.lock().await;
    if inner.generation != generation {
        tracing::debug!(host = %host, "Connect attempt superseded");
        return Err(ConnectionError::new(host.to_string(), ConnectFailure::Aborted));
    }
    inner.attempt = None;

    match opened {
        Ok((link, health)) => {
            inner.live = Some(install(&shared, generation, link, health));
            inner.last_error = None;
            shared.set_state(&mut inner, ConnectionState::Connected);
            Ok(())
        }
        Err(cause) => {
            let err = ConnectionError::new(host.to_string(), cause);
            tracing::warn!(host = %host, error = %err, "Connect failed");
            inner.last_error = Some(err.clone());
            shared.set_state(&mut inner, ConnectionState::Error);
            Err(err)
        }
    }
}

fn install(shared: &Arc<SharedState>, generation: u64, link: Link, health: HealthReport) -> Live {
    let closing = CancellationToken::new();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_link(link.sink, outbound_rx, closing.clone()));
    let reader = tokio::spawn(read_link(
        shared.clone(),
        generation,
        link.events,
        closing.clone(),
    ));
    Live {
        generation,
        outbound,
        closing,
        reader,
        writer,
        health,
    }
}

async fn write_link(mut sink: FrameSink, mut frames: mpsc::Receiver<String>, closing: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = closing.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Link write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_link(
    shared: Arc<SharedState>,
    generation: u64,
    mut events: BoxStream<'static, TransportEvent>,
    closing: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closing.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(TransportEvent::Frame(text)) => dispatch(&shared, &text).await,
            Some(TransportEvent::Closed(reason)) => return link_lost(&shared, generation, reason).await,
            None => return link_lost(&shared, generation, "link ended".to_string()).await,
        }
    }
}

/// Abnormal end of the link: move to `error` and cascade
async fn link_lost(shared: &SharedState, generation: u64, reason: String) {
    let mut inner = shared.inner.lock().await;
    if inner.live.as_ref().map(|l| l.generation) != Some(generation) {
        return;
    }
    if let Some(live) = inner.live.take() {
        live.closing.cancel();
    }
    let err = ConnectionError::new(shared.host.to_string(), ConnectFailure::Transport(reason));
    tracing::warn!(host = %shared.host, error = %err, "Link lost");
    inner.last_error = Some(err);
    inner.cascade();
    shared.set_state(&mut inner, ConnectionState::Error);
}

/// Deliver without blocking the reader; a full subscriber loses the item
fn offer<T>(tx: &mpsc::Sender<T>, item: T, what: &str, host: &HostAddr) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(host = %host, "{} subscriber is full, dropping", what);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn dispatch(shared: &SharedState, text: &str) {
    let host = &shared.host;
    let event = match Envelope::decode(text).and_then(|env| {
        let kind = env.kind.clone();
        AgentEvent::from_envelope(&env).map(|event| (kind, event))
    }) {
        Ok((_, Some(event))) => event,
        Ok((kind, None)) => {
            tracing::debug!(host = %host, kind = %kind, "Ignoring unknown envelope kind");
            return;
        }
        Err(e) => {
            tracing::warn!(host = %host, error = %e, "Dropping malformed envelope");
            return;
        }
    };

    let mut inner = shared.inner.lock().await;
    match event {
        AgentEvent::Metrics(snapshot) => {
            inner
                .metrics
                .retain(|tx| offer(tx, snapshot.clone(), "metrics", host));
        }
        AgentEvent::ContainerDetails(details) => {
            let event = StreamEvent::Details(details.details);
            deliver(&mut inner, &details.target_id, details.stream_id, event, host);
        }
        AgentEvent::LogLine(line) => {
            let event = StreamEvent::Line(line.line);
            deliver(&mut inner, &line.target_id, line.stream_id, event, host);
        }
        AgentEvent::StreamEnd(end) => {
            let event = StreamEvent::Ended(end.reason);
            if deliver(&mut inner, &end.target_id, end.stream_id, event, host) {
                inner.streams.remove(&end.target_id);
            }
        }
        AgentEvent::Error(notice) => match notice.target_id.clone() {
            Some(target) => {
                let event = StreamEvent::Error(notice.message);
                deliver(&mut inner, &target, notice.stream_id, event, host);
            }
            None => {
                tracing::warn!(host = %host, message = %notice.message, "Agent error");
                inner.errors.retain(|tx| offer(tx, notice.clone(), "error", host));
            }
        },
        AgentEvent::Response(response) => match inner.pending.remove(&response.correlation_key) {
            Some(pending) => {
                tracing::debug!(
                    host = %host,
                    action = pending.action,
                    elapsed_ms = pending.issued.elapsed().as_millis() as u64,
                    "Command resolved"
                );
                let action = pending.action;
                let result = response.into_result().map_err(|failure| CommandError::Rejected {
                    action: action.to_string(),
                    kind: failure.kind.to_string(),
                    message: failure.message,
                });
                let _ = pending.reply.send(result);
            }
            None => tracing::warn!(
                host = %host,
                correlation_key = %response.correlation_key,
                "Discarding response for unknown or completed command"
            ),
        },
    }
}

/// Hand `event` to the stream currently open for `target`.
///
/// An event tagged with another stream's id belongs to a replaced producer
/// and is dropped. Untagged events go to whichever stream is open. Returns
/// whether the event reached the current stream.
fn deliver(
    inner: &mut Inner,
    target: &str,
    stream_id: Option<u64>,
    event: StreamEvent,
    host: &HostAddr,
) -> bool {
    let open = match inner.streams.get(target) {
        Some(slot) if stream_id.is_some_and(|id| id != slot.id) => {
            tracing::debug!(
                host = %host,
                target_id = %target,
                stream_id = ?stream_id,
                current = slot.id,
                "Dropping event from a replaced stream"
            );
            return false;
        }
        Some(slot) => offer(&slot.tx, event, "stream", host),
        None => {
            tracing::debug!(host = %host, target_id = %target, "Event for unknown stream");
            return false;
        }
    };
    if !open {
        inner.streams.remove(target);
    }
    true
}

/// Events of one named log stream.
///
/// Ends when the agent ends the stream, a newer stream for the same target
/// replaces it, or the connection leaves `connected`.
pub struct LogStream {
    target: String,
    id: u64,
    events: ReceiverStream<StreamEvent>,
    connection: Option<Connection>,
}

impl LogStream {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stop the stream and tell the agent
    pub async fn stop(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.release_stream(&self.target, self.id, true).await;
        }
    }
}

impl Stream for LogStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let target = std::mem::take(&mut self.target);
            let id = self.id;
            runtime.spawn(async move { connection.release_stream(&target, id, true).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kind, CommandResponse, FailureKind, LogLine, StreamEnd, TargetDetails};
    use crate::testing::MemoryConnector;

    fn connection(connector: &Arc<MemoryConnector>) -> Connection {
        Connection::new(
            HostAddr::new("db1", 8443),
            connector.clone(),
            ConnectionSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_connect_shares_one_handshake() {
        let connector = Arc::new(MemoryConnector::with_open_delay(Duration::from_millis(50)));
        let conn = connection(&connector);

        let (a, b) = tokio::join!(conn.connect(), conn.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.opens(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);

        // Already connected: returns without a new handshake
        conn.connect().await.unwrap();
        assert_eq!(connector.opens(), 1);
        assert!(conn.health().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_health_failure_then_retry() {
        let connector = Arc::new(MemoryConnector::default());
        connector.set_health_status("degraded");
        let conn = connection(&connector);

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err.cause, ConnectFailure::HealthCheck(_)));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(conn.last_error().await, Some(err));

        connector.set_health_status("ok");
        conn.connect().await.unwrap();
        assert_eq!(connector.opens(), 2);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connect_is_error() {
        let connector = Arc::new(MemoryConnector::default());
        connector.refuse(true);
        let conn = connection(&connector);
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err.cause, ConnectFailure::Transport(_)));
        assert_eq!(err.host, "db1:8443");
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let connector = Arc::new(MemoryConnector::with_open_delay(Duration::from_secs(30)));
        let conn = connection(&connector);
        let err = conn.connect().await.unwrap_err();
        assert_eq!(err.cause, ConnectFailure::Timeout(Duration::from_secs(5)));
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_attempt_in_flight() {
        let connector = Arc::new(MemoryConnector::with_open_delay(Duration::from_millis(100)));
        let conn = connection(&connector);

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.disconnect().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.cause, ConnectFailure::Aborted);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_interleaved_responses_resolve_their_callers() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(CommandAction::Exec {
                    command: "first".to_string(),
                })
                .await
            })
        };
        let k1 = agent.next_request().await;
        let second = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(CommandAction::Exec {
                    command: "second".to_string(),
                })
                .await
            })
        };
        let k2 = agent.next_request().await;

        agent.send(AgentEvent::Response(CommandResponse::success(
            &k2.correlation_key,
            serde_json::json!("two"),
        )));
        agent.send(AgentEvent::Response(CommandResponse::success(
            &k1.correlation_key,
            serde_json::json!("one"),
        )));
        // Duplicate for k1 is discarded
        agent.send(AgentEvent::Response(CommandResponse::success(
            &k1.correlation_key,
            serde_json::json!("again"),
        )));

        assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), serde_json::json!("two"));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_error_outcome_is_rejected() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let call = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(CommandAction::Inspect {
                    target_id: "c9".to_string(),
                })
                .await
            })
        };
        let request = agent.next_request().await;
        agent.send(AgentEvent::Response(CommandResponse::failure(
            &request.correlation_key,
            FailureKind::Failed,
            "no such container",
        )));

        match call.await.unwrap() {
            Err(CommandError::Rejected {
                action,
                kind,
                message,
            }) => {
                assert_eq!(action, "inspect");
                assert_eq!(kind, "failed");
                assert_eq!(message, "no such container");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_requires_connection() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        assert_eq!(
            conn.request(CommandAction::SystemInfo {}).await,
            Err(CommandError::NotConnected)
        );
        assert!(conn.subscribe_metrics().await.is_err());
    }

    #[tokio::test]
    async fn test_network_drop_cascades_and_allows_fresh_connect() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let mut metrics = conn.subscribe_metrics().await.unwrap();
        let mut logs = conn.stream_logs(StartStream::new("c1")).await.unwrap();
        assert_eq!(agent.next_frame().await.kind(), kind::START);
        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(CommandAction::Exec {
                    command: "long".to_string(),
                })
                .await
            })
        };
        agent.next_request().await;

        let mut states = conn.watch_state();
        agent.drop_link("connection reset");

        states
            .wait_for(|s| *s == ConnectionState::Error)
            .await
            .unwrap();
        assert!(metrics.next().await.is_none());
        assert!(logs.next().await.is_none());
        assert_eq!(pending.await.unwrap(), Err(CommandError::ConnectionClosed));
        let err = conn.last_error().await.unwrap();
        assert!(matches!(err.cause, ConnectFailure::Transport(ref r) if r.contains("reset")));

        conn.connect().await.unwrap();
        assert_eq!(connector.opens(), 2);
        assert!(conn.is_connected());
    }

    fn started_id(frame: ConsoleFrame) -> u64 {
        match frame {
            ConsoleFrame::Start(start) => start.stream_id.expect("start frame without stream id"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    fn line(target: &str, stream_id: Option<u64>, text: &str) -> AgentEvent {
        AgentEvent::LogLine(LogLine {
            target_id: target.to_string(),
            stream_id,
            line: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_log_stream_routing_and_replacement() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let mut first = conn.stream_logs(StartStream::new("c1")).await.unwrap();
        let first_id = started_id(agent.next_frame().await);

        agent.send(AgentEvent::ContainerDetails(TargetDetails {
            target_id: "c1".to_string(),
            stream_id: Some(first_id),
            details: ContainerDetails {
                id: "c1-full-id".to_string(),
                ..Default::default()
            },
        }));
        agent.send(line("c1", Some(first_id), "hello"));
        agent.send(line("other", None, "not mine"));
        assert!(matches!(first.next().await, Some(StreamEvent::Details(d)) if d.id == "c1-full-id"));
        assert_eq!(first.next().await, Some(StreamEvent::Line("hello".to_string())));

        // A second stream for the same target replaces the first
        let mut second = conn.stream_logs(StartStream::new("c1")).await.unwrap();
        let second_id = started_id(agent.next_frame().await);
        assert_ne!(first_id, second_id);
        assert!(first.next().await.is_none());
        // Dropping the replaced stream must not stop the new one
        drop(first);

        // Trailing events of the replaced producer never reach the new stream
        agent.send(line("c1", Some(first_id), "stale"));
        agent.send(AgentEvent::StreamEnd(StreamEnd {
            target_id: "c1".to_string(),
            stream_id: Some(first_id),
            reason: "completed".to_string(),
        }));
        agent.send(line("c1", Some(second_id), "fresh"));
        assert_eq!(second.next().await, Some(StreamEvent::Line("fresh".to_string())));

        agent.send(AgentEvent::StreamEnd(StreamEnd {
            target_id: "c1".to_string(),
            stream_id: Some(second_id),
            reason: "completed".to_string(),
        }));
        assert_eq!(
            second.next().await,
            Some(StreamEvent::Ended("completed".to_string()))
        );
        assert!(second.next().await.is_none());
        assert!(agent.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_untagged_stream_events_reach_open_stream() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let mut logs = conn.stream_logs(StartStream::new("c1")).await.unwrap();
        agent.next_frame().await;

        agent.send(line("c1", None, "legacy"));
        agent.send(AgentEvent::Error(ErrorNotice::for_target("c1", "source hiccup")));
        agent.send(AgentEvent::StreamEnd(StreamEnd {
            target_id: "c1".to_string(),
            stream_id: None,
            reason: "failed".to_string(),
        }));
        assert_eq!(logs.next().await, Some(StreamEvent::Line("legacy".to_string())));
        assert_eq!(
            logs.next().await,
            Some(StreamEvent::Error("source hiccup".to_string()))
        );
        assert_eq!(logs.next().await, Some(StreamEvent::Ended("failed".to_string())));
        assert!(logs.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_log_stream_sends_stop() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let stream = conn.stream_logs(StartStream::new("c1")).await.unwrap();
        assert_eq!(agent.next_frame().await.kind(), kind::START);
        drop(stream);

        match agent.next_frame().await {
            ConsoleFrame::Stop(target) => assert_eq!(target.target_id, "c1"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_stall_responses() {
        let connector = Arc::new(MemoryConnector::default());
        let settings = ConnectionSettings {
            subscriber_capacity: 2,
            ..Default::default()
        };
        let conn = Connection::new(HostAddr::new("db1", 8443), connector.clone(), settings);
        conn.connect().await.unwrap();
        let mut agent = connector.take_agent().await;

        let mut metrics = conn.subscribe_metrics().await.unwrap();
        for n in 0..5 {
            agent.send(AgentEvent::Metrics(MetricsSnapshot {
                timestamp: n,
                ..Default::default()
            }));
        }

        let call = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request(CommandAction::ListContainers {}).await })
        };
        let request = agent.next_request().await;
        agent.send(AgentEvent::Response(CommandResponse::success(
            &request.correlation_key,
            serde_json::json!([]),
        )));
        assert!(call.await.unwrap().is_ok());

        assert_eq!(metrics.next().await.unwrap().timestamp, 0);
        assert_eq!(metrics.next().await.unwrap().timestamp, 1);
        conn.disconnect().await;
        assert!(metrics.next().await.is_none());
    }

    #[tokio::test]
    async fn test_untargeted_errors_reach_error_subscribers() {
        let connector = Arc::new(MemoryConnector::default());
        let conn = connection(&connector);
        conn.connect().await.unwrap();
        let agent = connector.take_agent().await;

        let mut errors = conn.subscribe_errors().await.unwrap();
        agent.send(AgentEvent::Error(ErrorNotice::new("Invalid message format")));
        agent.send_raw("garbage that is not an envelope");
        agent.send_raw(r#"{"kind":"gpuStats","payload":{},"timestamp":1}"#);
        agent.send(AgentEvent::Error(ErrorNotice::new("second")));

        assert_eq!(errors.next().await.unwrap().message, "Invalid message format");
        assert_eq!(errors.next().await.unwrap().message, "second");
        assert!(conn.is_connected());
    }
}
