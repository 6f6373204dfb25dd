//! Agent server implementation

use super::handler::{router, ApiState};
use crate::collect::{
    CommandExecutor, DockerCli, HostExecutor, LogSource, MetricsSource, ResourceInspector,
    SysinfoMetrics,
};
use crate::config::{AgentConfig, CommandTimeouts, ServerTuiConfig};
use crate::error::{Error, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Agent server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not serving
    Stopped,
    /// Accepting connections
    Running,
    /// Draining connections
    ShuttingDown,
}

/// Collaborators and settings handed to every connection
#[derive(Clone)]
pub struct AgentServices {
    pub metrics: Arc<dyn MetricsSource>,
    pub logs: Arc<dyn LogSource>,
    pub inspector: Arc<dyn ResourceInspector>,
    pub executor: Arc<dyn CommandExecutor>,
    pub agent: AgentConfig,
    pub timeouts: CommandTimeouts,
}

impl AgentServices {
    /// Host adapters: `sysinfo` metrics, the docker CLI and a shell
    pub fn host(config: &ServerTuiConfig) -> Self {
        let metrics: Arc<dyn MetricsSource> = Arc::new(SysinfoMetrics::new());
        let docker = DockerCli::new(&config.agent.docker_bin);
        Self {
            executor: Arc::new(HostExecutor::new(
                &config.agent.shell,
                docker.clone(),
                metrics.clone(),
            )),
            logs: Arc::new(docker.clone()),
            inspector: Arc::new(docker),
            metrics,
            agent: config.agent.clone(),
            timeouts: config.commands.clone(),
        }
    }
}

/// Resident agent: HTTP probes plus the `/ws` control channel.
///
/// A server serves once; after [`AgentServer::shutdown`] build a new one.
pub struct AgentServer {
    config: ServerTuiConfig,
    services: AgentServices,
    state: Arc<RwLock<ServerState>>,
    shutdown: CancellationToken,
}

impl AgentServer {
    /// Create a server with the host adapters
    pub fn new(config: ServerTuiConfig) -> Result<Self> {
        AgentServerBuilder::new().config(config).build()
    }

    /// Get current state
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Get the configuration
    pub fn config(&self) -> &ServerTuiConfig {
        &self.config
    }

    /// Router with tracing and CORS layers
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router(ApiState {
            services: self.services.clone(),
            shutdown: self.shutdown.clone(),
        })
        .layer(TraceLayer::new_for_http())
        .layer(cors)
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.agent.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind {}: {}", addr, e)))
    }

    /// Serve on `listener` until [`AgentServer::shutdown`] is called.
    ///
    /// Every open channel is closed and drained before this returns.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped || self.shutdown.is_cancelled() {
                return Err(Error::Transport("Agent server already used".to_string()));
            }
            *state = ServerState::Running;
        }

        let addr = listener.local_addr()?;
        tracing::info!(
            addr = %addr,
            interval_ms = self.config.agent.metrics_interval_ms,
            "Agent listening"
        );

        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            *state.write().await = ServerState::ShuttingDown;
            tracing::info!("Agent shutting down");
        })
        .await;

        *self.state.write().await = ServerState::Stopped;
        tracing::info!("Agent stopped");
        result.map_err(Error::from)
    }

    /// Request shutdown; cancels every connection's root token
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Builder for [`AgentServer`]
pub struct AgentServerBuilder {
    config: ServerTuiConfig,
    metrics: Option<Arc<dyn MetricsSource>>,
    logs: Option<Arc<dyn LogSource>>,
    inspector: Option<Arc<dyn ResourceInspector>>,
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl AgentServerBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: ServerTuiConfig::default(),
            metrics: None,
            logs: None,
            inspector: None,
            executor: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: ServerTuiConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the listen host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.agent.host = host.into();
        self
    }

    /// Set the listen port
    pub fn port(mut self, port: u16) -> Self {
        self.config.agent.port = port;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logs(mut self, logs: Arc<dyn LogSource>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn ResourceInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the server. Collaborators left unset use the host adapters.
    pub fn build(self) -> Result<AgentServer> {
        self.config.validate()?;
        let host = AgentServices::host(&self.config);
        let services = AgentServices {
            metrics: self.metrics.unwrap_or(host.metrics),
            logs: self.logs.unwrap_or(host.logs),
            inspector: self.inspector.unwrap_or(host.inspector),
            executor: self.executor.unwrap_or(host.executor),
            agent: host.agent,
            timeouts: host.timeouts,
        };
        Ok(AgentServer {
            config: self.config,
            services,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for AgentServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
