//! ServerTUI - real-time control channel between a console and host agents
//!
//! A resident agent on each managed host serves a WebSocket control channel.
//! Over one connection it pushes metrics ticks, streams container logs on
//! request and answers one-shot commands. The console keeps at most one
//! live connection per host and serializes commands that need exclusive
//! use of a host.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── Console ────────────────────────┐
//! │  ConnectionSupervisor ── Connection (per host)          │
//! │        │                   ├─ reader task → subscribers │
//! │  CommandQueue ─────────────┘   metrics / logs / errors  │
//! └────────────────────────────┬────────────────────────────┘
//!                              │ ws://host:8443/ws
//! ┌────────────────────────────▼──────── Agent ─────────────┐
//! │  writer task ◄── control lane ◄── CommandGateway        │
//! │              ◄── stream lane  ◄── MetricsPublisher      │
//! │                               ◄── StreamMultiplexer     │
//! │  collectors: sysinfo, docker CLI, shell                 │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: agent server, control channel and its producers
//! - [`console`]: connection supervisor, connections and command queue
//! - [`protocol`]: envelope and payload types shared by both ends
//! - [`collect`]: host collectors behind the agent
//! - [`config`]: configuration management

pub mod collect;
pub mod config;
pub mod console;
pub mod error;
pub mod gateway;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use config::ServerTuiConfig;
pub use error::{Error, Result};
