//! Wire protocol between console and agent
//!
//! Every frame is a JSON [`Envelope`] `{ kind, payload, timestamp }` sent as
//! a WebSocket text message. [`AgentEvent`] and [`ConsoleFrame`] are the typed
//! views of the kinds each side produces; unknown kinds decode to `None` so
//! that either side can be upgraded independently.

mod command;
mod envelope;

pub use command::{
    CommandAction, CommandFailure, CommandRequest, CommandResponse, FailureKind,
};
pub use envelope::{
    kind, AgentEvent, ConsoleFrame, Envelope, ErrorNotice, LogLine, StartStream, StreamEnd,
    StreamTarget, TargetDetails,
};

use serde::{Deserialize, Serialize};

/// Response body of the agent's `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Feature an agent advertises in its health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Unsolicited metrics ticks
    Metrics,
    /// `start`/`stop` log streams
    Logs,
    /// One-shot command requests
    Commands,
    /// Advertised by a newer agent; ignored
    #[serde(other)]
    Unknown,
}
