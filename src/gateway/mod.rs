//! Agent side of the control channel
//!
//! Serves `GET /health`, the one-shot `/api/*` probes and the `/ws` control
//! channel. Each channel runs a metrics publisher, a stream multiplexer and
//! a command gateway behind a single writer task.

mod commands;
mod handler;
mod multiplexer;
mod publisher;
mod relay;
mod server;
mod websocket;

pub use commands::CommandGateway;
pub use multiplexer::{StreamMultiplexer, StreamSettings, END_COMPLETED, END_FAILED};
pub use publisher::{MetricsPublisher, PublisherReport};
pub use relay::{Relay, RelayReceiver};
pub use server::{AgentServer, AgentServerBuilder, AgentServices, ServerState};
pub use websocket::{run_channel, Inbound};
