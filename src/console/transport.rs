//! Console transport: WebSocket link plus health check

use super::host::HostAddr;
use crate::error::{ConnectFailure, Error};
use crate::protocol::HealthReport;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::Message;

/// What the read half of a link yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text frame
    Frame(String),
    /// The agent closed the link or it broke
    Closed(String),
}

/// Write half of a link: one text frame per item
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// An open, message-oriented link to one agent
pub struct Link {
    pub sink: FrameSink,
    pub events: BoxStream<'static, TransportEvent>,
}

/// Opens links and runs health checks
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, host: &HostAddr) -> std::result::Result<Link, ConnectFailure>;

    async fn health(&self, host: &HostAddr) -> std::result::Result<HealthReport, ConnectFailure>;
}

/// `ws://host:port/ws` plus `GET http://host:port/health`
#[derive(Clone, Default)]
pub struct WsConnector {
    http: reqwest::Client,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, host: &HostAddr) -> std::result::Result<Link, ConnectFailure> {
        let (socket, _response) = tokio_tungstenite::connect_async(host.ws_url())
            .await
            .map_err(|e| ConnectFailure::Transport(e.to_string()))?;
        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(|e| Error::Transport(e.to_string()))
            .with(|text: String| futures::future::ready(Ok::<_, Error>(Message::Text(text))));

        let events = read.filter_map(|message| {
            let event = match message {
                Ok(Message::Text(text)) => Some(TransportEvent::Frame(text)),
                Ok(Message::Close(frame)) => Some(TransportEvent::Closed(match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("closed by agent: {}", frame.reason)
                    }
                    _ => "closed by agent".to_string(),
                })),
                Ok(_) => None,
                Err(e) => Some(TransportEvent::Closed(e.to_string())),
            };
            futures::future::ready(event)
        });

        Ok(Link {
            sink: Box::pin(sink),
            events: events.boxed(),
        })
    }

    async fn health(&self, host: &HostAddr) -> std::result::Result<HealthReport, ConnectFailure> {
        let response = self
            .http
            .get(host.health_url())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ConnectFailure::HealthCheck(e.to_string()))?;
        let report: HealthReport = response
            .json()
            .await
            .map_err(|e| ConnectFailure::HealthCheck(format!("invalid health report: {}", e)))?;
        if !report.is_ok() {
            return Err(ConnectFailure::HealthCheck(format!(
                "agent reported status {:?}",
                report.status
            )));
        }
        Ok(report)
    }
}
