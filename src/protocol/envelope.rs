//! Envelope framing and the typed messages carried inside it

use super::command::{CommandRequest, CommandResponse};
use crate::collect::{ContainerDetails, MetricsSnapshot};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope kinds understood by this version of the protocol
pub mod kind {
    pub const METRICS: &str = "metrics";
    pub const CONTAINER_DETAILS: &str = "containerDetails";
    pub const LOG_LINE: &str = "logLine";
    pub const STREAM_END: &str = "streamEnd";
    pub const ERROR: &str = "error";
    pub const RESPONSE: &str = "response";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const REQUEST: &str = "request";
}

/// The unit of transport: one text frame on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap a payload, stamping it with the current time
    pub fn new(kind: &str, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            // Cut on a char boundary; frames may carry arbitrary UTF-8
            let preview = text
                .char_indices()
                .nth(PREVIEW_CHARS)
                .map_or(text, |(end, _)| &text[..end]);
            Error::Protocol(format!("malformed envelope: {} (raw: {})", e, preview))
        })
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::Protocol(format!("invalid {} payload: {}", self.kind, e))
        })
    }
}

/// Characters of a malformed frame quoted in its error
const PREVIEW_CHARS: usize = 120;

/// Names the target of a stream control frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTarget {
    #[serde(default)]
    pub target_id: String,
}

impl StreamTarget {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
        }
    }
}

/// Payload of a `start` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStream {
    #[serde(default)]
    pub target_id: String,
    /// Keep streaming new output after the historical tail
    #[serde(default = "default_true")]
    pub follow: bool,
    /// Historical lines to replay; the agent default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u32>,
    /// Send a `containerDetails` snapshot before the first line
    #[serde(default = "default_true")]
    pub details: bool,
    /// Chosen by the console and echoed on every event of this stream, so
    /// events from a replaced producer can be told apart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl StartStream {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            follow: true,
            tail: None,
            details: true,
            stream_id: None,
        }
    }
}

/// Payload of a `containerDetails` envelope: the details plus the target
/// id the stream was started with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    #[serde(flatten)]
    pub details: ContainerDetails,
}

/// Payload of a `logLine` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    pub line: String,
}

/// Payload of a `streamEnd` envelope, sent when a producer ends on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnd {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    pub reason: String,
}

/// Payload of an `error` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
}

impl ErrorNotice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target_id: None,
            stream_id: None,
        }
    }

    pub fn for_target(target_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target_id: Some(target_id.into()),
            stream_id: None,
        }
    }

    /// Tag the notice with the stream it belongs to
    pub fn in_stream(mut self, stream_id: Option<u64>) -> Self {
        self.stream_id = stream_id;
        self
    }
}

/// Frames produced by the agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Metrics(MetricsSnapshot),
    ContainerDetails(TargetDetails),
    LogLine(LogLine),
    StreamEnd(StreamEnd),
    Error(ErrorNotice),
    Response(CommandResponse),
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metrics(_) => kind::METRICS,
            Self::ContainerDetails(_) => kind::CONTAINER_DETAILS,
            Self::LogLine(_) => kind::LOG_LINE,
            Self::StreamEnd(_) => kind::STREAM_END,
            Self::Error(_) => kind::ERROR,
            Self::Response(_) => kind::RESPONSE,
        }
    }

    pub fn into_envelope(self) -> Result<Envelope> {
        let kind = self.kind();
        match self {
            Self::Metrics(m) => Envelope::new(kind, m),
            Self::ContainerDetails(d) => Envelope::new(kind, d),
            Self::LogLine(l) => Envelope::new(kind, l),
            Self::StreamEnd(e) => Envelope::new(kind, e),
            Self::Error(e) => Envelope::new(kind, e),
            Self::Response(r) => Envelope::new(kind, r),
        }
    }

    /// Decode an agent envelope. `Ok(None)` for kinds this build does not know.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>> {
        let event = match envelope.kind.as_str() {
            kind::METRICS => Self::Metrics(envelope.payload_as()?),
            kind::CONTAINER_DETAILS => Self::ContainerDetails(envelope.payload_as()?),
            kind::LOG_LINE => Self::LogLine(envelope.payload_as()?),
            kind::STREAM_END => Self::StreamEnd(envelope.payload_as()?),
            kind::ERROR => Self::Error(envelope.payload_as()?),
            kind::RESPONSE => Self::Response(envelope.payload_as()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Frames produced by the console
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleFrame {
    Start(StartStream),
    Stop(StreamTarget),
    Request(CommandRequest),
}

impl ConsoleFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => kind::START,
            Self::Stop(_) => kind::STOP,
            Self::Request(_) => kind::REQUEST,
        }
    }

    pub fn into_envelope(self) -> Result<Envelope> {
        let kind = self.kind();
        match self {
            Self::Start(s) => Envelope::new(kind, s),
            Self::Stop(s) => Envelope::new(kind, s),
            Self::Request(r) => Envelope::new(kind, r),
        }
    }

    /// Encode straight to the text frame
    pub fn encode(self) -> Result<String> {
        self.into_envelope()?.encode()
    }

    /// Decode a console envelope. `Ok(None)` for kinds this build does not know.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>> {
        let frame = match envelope.kind.as_str() {
            kind::START => Self::Start(envelope.payload_as()?),
            kind::STOP => Self::Stop(envelope.payload_as()?),
            kind::REQUEST => Self::Request(envelope.payload_as()?),
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }
}
