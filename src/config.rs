//! ServerTUI configuration management

use crate::error::{Error, Result};
use crate::protocol::CommandAction;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main ServerTUI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTuiConfig {
    /// Agent (server side) configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Per-action command timeouts, honoured by both ends
    #[serde(default)]
    pub commands: CommandTimeouts,

    /// Console (client side) configuration
    #[serde(default)]
    pub console: ConsoleConfig,
}

impl ServerTuiConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to render config: {}", e)))
    }

    /// Reject values the channel cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agent.port == 0 {
            return Err(Error::Config("agent.port must be between 1 and 65535".to_string()));
        }
        if self.console.port == 0 {
            return Err(Error::Config("console.port must be between 1 and 65535".to_string()));
        }
        if self.agent.metrics_interval_ms == 0 {
            return Err(Error::Config("agent.metrics_interval_ms must be positive".to_string()));
        }
        if self.agent.control_capacity == 0 || self.agent.stream_capacity == 0 {
            return Err(Error::Config("agent relay capacities must be positive".to_string()));
        }
        if self.console.queue_depth == 0 || self.console.subscriber_capacity == 0 {
            return Err(Error::Config("console queue sizes must be positive".to_string()));
        }
        if self.commands.exec_secs == 0
            || self.commands.inspect_secs == 0
            || self.commands.lifecycle_secs == 0
            || self.commands.updates_secs == 0
            || self.commands.upgrade_secs == 0
        {
            return Err(Error::Config("command timeouts must be positive".to_string()));
        }
        Ok(())
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host to bind to
    pub host: String,

    /// Control-plane port
    pub port: u16,

    /// Interval between metrics pushes, in milliseconds
    pub metrics_interval_ms: u64,

    /// Historical lines sent when a log stream starts
    pub log_tail: u32,

    /// Capacity of the control lane (responses, errors, details)
    pub control_capacity: usize,

    /// Capacity of the stream lane (metrics ticks, log lines)
    pub stream_capacity: usize,

    /// Docker CLI used for logs, inspection and container lifecycle
    pub docker_bin: String,

    /// Shell used for `exec` commands
    pub shell: String,
}

impl AgentConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            metrics_interval_ms: 1000,
            log_tail: 100,
            control_capacity: 64,
            stream_capacity: 128,
            docker_bin: "docker".to_string(),
            shell: "sh".to_string(),
        }
    }
}

/// Per-action command timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTimeouts {
    /// Arbitrary shell commands
    pub exec_secs: u64,

    /// Inspection calls (details, listings, system info)
    pub inspect_secs: u64,

    /// Container start/stop
    pub lifecycle_secs: u64,

    /// Listing pending OS package updates, including the cache refresh
    pub updates_secs: u64,

    /// Installing one or all OS package updates
    pub upgrade_secs: u64,
}

impl CommandTimeouts {
    /// Deadline for an action
    pub fn for_action(&self, action: &CommandAction) -> Duration {
        let secs = match action {
            CommandAction::Exec { .. } => self.exec_secs,
            CommandAction::StartContainer { .. } | CommandAction::StopContainer { .. } => {
                self.lifecycle_secs
            }
            CommandAction::Inspect { .. }
            | CommandAction::SystemInfo {}
            | CommandAction::ListContainers {} => self.inspect_secs,
            CommandAction::ListUpdates {} => self.updates_secs,
            CommandAction::ApplyUpdate { .. } | CommandAction::ApplyAllUpdates {} => {
                self.upgrade_secs
            }
        };
        Duration::from_secs(secs)
    }

    pub fn inspect(&self) -> Duration {
        Duration::from_secs(self.inspect_secs)
    }
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            exec_secs: 120,
            inspect_secs: 5,
            lifecycle_secs: 30,
            updates_secs: 120,
            upgrade_secs: 900,
        }
    }
}

/// Console configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Agent port assumed when a host is given without one
    pub port: u16,

    /// Upper bound on WebSocket handshake plus health check
    pub connect_timeout_ms: u64,

    /// Pending submissions the serialization queue accepts
    pub queue_depth: usize,

    /// Envelopes buffered per subscriber before drops start
    pub subscriber_capacity: usize,

    /// Added to the agent-side deadline before a round trip is abandoned
    pub response_grace_ms: u64,
}

impl ConsoleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_grace(&self) -> Duration {
        Duration::from_millis(self.response_grace_ms)
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            connect_timeout_ms: 5000,
            queue_depth: 64,
            subscriber_capacity: 256,
            response_grace_ms: 2000,
        }
    }
}
