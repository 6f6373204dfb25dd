//! In-memory collaborators for unit tests

use crate::collect::{
    CommandExecutor, ContainerDetails, ContainerSummary, LineStream, LogOptions, LogSource,
    MetricsSnapshot, MetricsSource, ResourceInspector, SystemInfo,
};
use crate::console::{Connector, HostAddr, Link, TransportEvent};
use crate::error::{ConnectFailure, Error, Result};
use crate::protocol::{
    AgentEvent, Capability, CommandAction, CommandRequest, ConsoleFrame, Envelope, HealthReport,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Stamps each snapshot's `timestamp` with its 1-based call number
#[derive(Default)]
pub struct FakeMetrics {
    calls: AtomicUsize,
    fail_on: Vec<usize>,
}

impl FakeMetrics {
    pub fn failing_on(calls: &[usize]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: calls.to_vec(),
        }
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn sample(&self) -> Result<MetricsSnapshot> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&call) {
            return Err(Error::Collection(format!("probe {} failed", call)));
        }
        Ok(MetricsSnapshot {
            timestamp: call as i64,
            ..Default::default()
        })
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            hostname: "fake-host".to_string(),
            ..Default::default()
        })
    }
}

/// What a followed target produces
#[derive(Debug, Clone)]
pub enum Feed {
    /// `line-0`, `line-1`, ... every few milliseconds until dropped
    Endless,
    /// These lines, then the source ends
    Lines(Vec<String>),
    /// These lines, then a read error
    FailAfter(Vec<String>),
    /// `follow` itself fails
    Refuse,
}

/// Counts live streams so tests can see producers release their source
#[derive(Default)]
pub struct FakeLogs {
    feeds: Mutex<HashMap<String, Feed>>,
    live: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLogs {
    pub fn with_feed(self, target: &str, feed: Feed) -> Self {
        self.feeds
            .lock()
            .unwrap()
            .insert(target.to_string(), feed);
        self
    }

    /// Streams opened and not yet dropped
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total successful `follow` calls
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSource for FakeLogs {
    async fn follow(
        &self,
        target: &str,
        _options: &LogOptions,
        _cancel: CancellationToken,
    ) -> Result<LineStream> {
        let feed = self
            .feeds
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or(Feed::Endless);

        if let Feed::Refuse = feed {
            return Err(Error::Collection(format!("no such container: {}", target)));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = LiveGuard(self.live.clone());

        let stream = async_stream::stream! {
            let _live = live;
            match feed {
                Feed::Endless => {
                    let mut n = 0u64;
                    loop {
                        yield Ok(format!("line-{}", n));
                        n += 1;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                Feed::Lines(lines) => {
                    for line in lines {
                        yield Ok(line);
                    }
                }
                Feed::FailAfter(lines) => {
                    for line in lines {
                        yield Ok(line);
                    }
                    yield Err(Error::Collection("log source broke".to_string()));
                }
                Feed::Refuse => {}
            }
        };
        Ok(stream.boxed())
    }
}

/// Describes any target except ones starting with `missing`
#[derive(Default)]
pub struct FakeInspector;

#[async_trait]
impl ResourceInspector for FakeInspector {
    async fn describe(&self, target: &str) -> Result<ContainerDetails> {
        if target.starts_with("missing") {
            return Err(Error::Collection(format!("no such container: {}", target)));
        }
        Ok(ContainerDetails {
            id: target.to_string(),
            name: format!("{}-name", target),
            state: "running".to_string(),
            ..Default::default()
        })
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        Ok(vec![ContainerSummary {
            id: "c1".to_string(),
            name: "web".to_string(),
            ..Default::default()
        }])
    }
}

/// `exec` echoes its command; `sleep <ms>` waits, `fail` errors
#[derive(Default)]
pub struct FakeExecutor {
    calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run(&self, action: &CommandAction) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match action {
            CommandAction::Exec { command } => {
                if let Some(ms) = command.strip_prefix("sleep ") {
                    let ms = ms.trim().parse::<u64>().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    return Ok(serde_json::json!({ "slept": ms }));
                }
                if command == "fail" {
                    return Err(Error::Collection("command exploded".to_string()));
                }
                Ok(serde_json::json!({ "stdout": command, "exitCode": 0 }))
            }
            CommandAction::Inspect { target_id } => Ok(serde_json::json!({ "id": target_id })),
            CommandAction::ListUpdates {} => Ok(serde_json::json!({
                "stdout": "curl/stable 8.5.0-2 amd64 [upgradable from: 8.4.0-1]\n",
                "exitCode": 0,
            })),
            CommandAction::ApplyUpdate { package } => {
                if package == "broken" {
                    return Err(Error::Collection("dpkg was interrupted".to_string()));
                }
                Ok(serde_json::json!({ "stdout": format!("Setting up {}", package), "exitCode": 0 }))
            }
            _ => Ok(serde_json::json!({})),
        }
    }
}

/// Agent side of a [`MemoryConnector`] link
pub struct AgentEnd {
    frames: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl AgentEnd {
    pub fn send(&self, event: AgentEvent) {
        let text = event.into_envelope().and_then(|e| e.encode()).unwrap();
        self.send_raw(&text);
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Frame(text.to_string()));
    }

    /// Break the link as a network failure would
    pub fn drop_link(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Closed(reason.to_string()));
    }

    pub async fn next_frame(&mut self) -> ConsoleFrame {
        let text = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("no frame from console")
            .expect("console link closed");
        decode_frame(&text)
    }

    pub fn try_next_frame(&mut self) -> Option<ConsoleFrame> {
        self.frames.try_recv().ok().map(|text| decode_frame(&text))
    }

    /// Skip to the next command request
    pub async fn next_request(&mut self) -> CommandRequest {
        loop {
            if let ConsoleFrame::Request(request) = self.next_frame().await {
                return request;
            }
        }
    }
}

fn decode_frame(text: &str) -> ConsoleFrame {
    ConsoleFrame::from_envelope(&Envelope::decode(text).unwrap())
        .unwrap()
        .expect("unknown console frame")
}

/// In-process links; each successful `open` queues an [`AgentEnd`]
pub struct MemoryConnector {
    opens: AtomicUsize,
    open_delay: Duration,
    refuse: AtomicBool,
    health_status: Mutex<String>,
    capabilities: Mutex<Vec<Capability>>,
    ends_tx: mpsc::UnboundedSender<AgentEnd>,
    ends_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AgentEnd>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::with_open_delay(Duration::ZERO)
    }
}

impl MemoryConnector {
    pub fn with_open_delay(open_delay: Duration) -> Self {
        let (ends_tx, ends_rx) = mpsc::unbounded_channel();
        Self {
            opens: AtomicUsize::new(0),
            open_delay,
            refuse: AtomicBool::new(false),
            health_status: Mutex::new("ok".to_string()),
            capabilities: Mutex::new(vec![
                Capability::Metrics,
                Capability::Logs,
                Capability::Commands,
            ]),
            ends_tx,
            ends_rx: tokio::sync::Mutex::new(ends_rx),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_health_status(&self, status: &str) {
        *self.health_status.lock().unwrap() = status.to_string();
    }

    pub fn set_capabilities(&self, capabilities: Vec<Capability>) {
        *self.capabilities.lock().unwrap() = capabilities;
    }

    /// Agent end of the oldest link not yet taken
    pub async fn take_agent(&self) -> AgentEnd {
        self.ends_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _host: &HostAddr) -> std::result::Result<Link, ConnectFailure> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectFailure::Transport("connection refused".to_string()));
        }

        let (frames_tx, frames) = mpsc::unbounded_channel::<String>();
        let (events, events_rx) = mpsc::unbounded_channel();
        let sink = futures::sink::unfold(frames_tx, |tx, frame: String| async move {
            tx.send(frame)
                .map_err(|_| Error::Transport("agent end dropped".to_string()))?;
            Ok::<_, Error>(tx)
        });
        let _ = self.ends_tx.send(AgentEnd { frames, events });

        Ok(Link {
            sink: Box::pin(sink),
            events: UnboundedReceiverStream::new(events_rx).boxed(),
        })
    }

    async fn health(&self, host: &HostAddr) -> std::result::Result<HealthReport, ConnectFailure> {
        let status = self.health_status.lock().unwrap().clone();
        if status != "ok" {
            return Err(ConnectFailure::HealthCheck(format!(
                "agent reported status {:?}",
                status
            )));
        }
        Ok(HealthReport {
            status,
            version: "test".to_string(),
            hostname: host.host.clone(),
            capabilities: self.capabilities.lock().unwrap().clone(),
        })
    }
}
