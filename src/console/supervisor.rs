//! Per-host connection registry
//!
//! The supervisor keeps one [`Connection`] per host and at most one active
//! host. Switching hosts disconnects the previous one before the new
//! attempt starts. The active slot only changes under the supervisor's own
//! lock, so two racing `connect()` calls cannot both own it.

use super::capability::TelemetryStrategy;
use super::connection::{Connection, ConnectionSettings, ConnectionState};
use super::host::HostAddr;
use super::transport::{Connector, WsConnector};
use crate::config::ServerTuiConfig;
use crate::error::{ConnectionError, Result};
use crate::protocol::HealthReport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    default_port: u16,
    registry: RwLock<HashMap<HostAddr, Connection>>,
    active: Mutex<Option<HostAddr>>,
}

impl ConnectionSupervisor {
    /// Supervisor speaking WebSocket to real agents
    pub fn new(config: &ServerTuiConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector::new()))
    }

    pub fn with_connector(config: &ServerTuiConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            settings: ConnectionSettings::from_config(config),
            default_port: config.console.port,
            registry: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// Parse a host argument with the configured default port
    pub fn host_addr(&self, input: &str) -> Result<HostAddr> {
        HostAddr::parse(input, self.default_port)
    }

    /// Handle for `host`, registering it in `disconnected` if new
    pub async fn acquire(&self, host: &HostAddr) -> Connection {
        if let Some(connection) = self.registry.read().await.get(host) {
            return connection.clone();
        }
        self.registry
            .write()
            .await
            .entry(host.clone())
            .or_insert_with(|| {
                tracing::debug!(host = %host, "Registering host");
                Connection::new(host.clone(), self.connector.clone(), self.settings.clone())
            })
            .clone()
    }

    /// Disconnect `host` and forget it
    pub async fn release(&self, host: &HostAddr) {
        let mut active = self.active.lock().await;
        if active.as_ref() == Some(host) {
            *active = None;
        }
        let removed = self.registry.write().await.remove(host);
        if let Some(connection) = removed {
            connection.disconnect().await;
        }
    }

    /// Make `host` the active host and connect it.
    ///
    /// Already connected returns immediately. A different active host is
    /// disconnected first. Concurrent calls for the same host share one
    /// handshake.
    pub async fn connect(&self, host: &HostAddr) -> std::result::Result<Connection, ConnectionError> {
        let (connection, attempt) = {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.clone().filter(|previous| previous != host) {
                tracing::info!(from = %previous, to = %host, "Switching host");
                let previous = self.registry.read().await.get(&previous).cloned();
                if let Some(previous) = previous {
                    previous.disconnect().await;
                }
            }
            *active = Some(host.clone());
            let connection = self.acquire(host).await;
            let attempt = connection.begin_connect().await;
            (connection, attempt)
        };

        if let Some(attempt) = attempt {
            attempt.await?;
        }
        Ok(connection)
    }

    async fn resolve(&self, host: Option<&HostAddr>) -> Option<Connection> {
        let host = match host {
            Some(host) => host.clone(),
            None => self.active.lock().await.clone()?,
        };
        self.registry.read().await.get(&host).cloned()
    }

    /// `host`, or the active host when `None`, is connected
    pub async fn is_connected(&self, host: Option<&HostAddr>) -> bool {
        self.resolve(host)
            .await
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Disconnect `host`, or the active host when `None`. Always safe.
    pub async fn disconnect(&self, host: Option<&HostAddr>) {
        let mut active = self.active.lock().await;
        let target = match host {
            Some(host) => host.clone(),
            None => match active.clone() {
                Some(host) => host,
                None => return,
            },
        };
        if active.as_ref() == Some(&target) {
            *active = None;
        }
        let connection = self.registry.read().await.get(&target).cloned();
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
    }

    pub async fn state(&self, host: &HostAddr) -> ConnectionState {
        self.resolve(Some(host))
            .await
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn last_error(&self, host: &HostAddr) -> Option<ConnectionError> {
        self.resolve(Some(host)).await?.last_error().await
    }

    pub async fn active_host(&self) -> Option<HostAddr> {
        self.active.lock().await.clone()
    }

    /// Observe state transitions of `host`
    pub async fn watch_state(&self, host: &HostAddr) -> watch::Receiver<ConnectionState> {
        self.acquire(host).await.watch_state()
    }

    async fn health(&self, host: &HostAddr) -> Option<HealthReport> {
        self.resolve(Some(host)).await?.health().await
    }

    /// The agent on `host` is connected and publishes metrics
    pub async fn supports_direct_telemetry(&self, host: &HostAddr) -> bool {
        self.telemetry_strategy(host).await.is_direct()
    }

    pub async fn telemetry_strategy(&self, host: &HostAddr) -> TelemetryStrategy {
        TelemetryStrategy::select(self.health(host).await.as_ref())
    }

    /// Disconnect every registered host
    pub async fn shutdown(&self) {
        *self.active.lock().await = None;
        let connections: Vec<Connection> = self.registry.read().await.values().cloned().collect();
        for connection in connections {
            connection.disconnect().await;
        }
        tracing::info!("Supervisor shut down");
    }
}
