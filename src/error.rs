//! ServerTUI error types

use std::time::Duration;
use thiserror::Error;

/// ServerTUI error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error (connect refused, handshake failed, abnormal close)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected envelope
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An external collector call failed
    #[error("Collection error: {0}")]
    Collection(String),

    /// A one-shot command failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Console-side connection failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for ServerTUI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single command round trip.
///
/// Cloneable so the same outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No live connection to send the request on
    #[error("not connected")]
    NotConnected,

    /// The connection closed while the command was in flight
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// No response within the action's deadline
    #[error("{action} timed out after {}ms", .after.as_millis())]
    Timeout { action: String, after: Duration },

    /// The agent answered with an error outcome
    #[error("{action} failed ({kind}): {message}")]
    Rejected {
        action: String,
        kind: String,
        message: String,
    },

    /// The serialization queue is at capacity
    #[error("command queue is full")]
    QueueFull,

    /// The serialization queue worker has stopped
    #[error("command queue closed")]
    QueueClosed,

    /// The request frame could not be written
    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a connection attempt did not reach `connected`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Socket connect or WebSocket upgrade failed
    #[error("transport: {0}")]
    Transport(String),

    /// The agent was reachable but its health check did not pass
    #[error("health check: {0}")]
    HealthCheck(String),

    /// Handshake plus health check exceeded the connect timeout
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The attempt was superseded by a disconnect or host switch
    #[error("aborted")]
    Aborted,
}

/// Error surfaced by `connect()`, carrying the host and the cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connection to {host} failed: {cause}")]
pub struct ConnectionError {
    pub host: String,
    pub cause: ConnectFailure,
}

impl ConnectionError {
    pub fn new(host: impl Into<String>, cause: ConnectFailure) -> Self {
        Self {
            host: host.into(),
            cause,
        }
    }
}
