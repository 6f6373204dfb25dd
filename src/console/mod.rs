//! Console side of the control channel
//!
//! A [`ConnectionSupervisor`] owns one [`Connection`] per agent host. Each
//! live connection has a single reader task that routes metrics ticks, log
//! streams, errors and command responses to their subscribers.

mod capability;
mod connection;
mod host;
mod queue;
mod supervisor;
mod transport;

pub use capability::TelemetryStrategy;
pub use connection::{
    Connection, ConnectionSettings, ConnectionState, ErrorFeed, LogStream, MetricsFeed,
    StreamEvent,
};
pub use host::HostAddr;
pub use queue::{CommandChannel, CommandQueue, CommandTicket};
pub use supervisor::ConnectionSupervisor;
pub use transport::{Connector, FrameSink, Link, TransportEvent, WsConnector};
