//! ServerTUI - host agent and console client
//!
//! `servertui agent` runs the resident agent. The other subcommands are thin
//! console clients over the same control channel.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use servertui::{
    config::ServerTuiConfig,
    console::{CommandQueue, ConnectionSupervisor, StreamEvent},
    gateway::AgentServerBuilder,
    protocol::{CommandAction, StartStream},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "servertui")]
#[command(version)]
#[command(about = "Real-time control channel between a console and host agents")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SERVERTUI_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host agent
    Agent {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Metrics interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Print metrics ticks from an agent
    Watch {
        /// Agent host, optionally with :port
        host: String,

        /// Stop after this many ticks
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Tail a container's logs through an agent
    Logs {
        /// Agent host, optionally with :port
        host: String,

        /// Container id or name
        target: String,

        /// Lines of history to start with
        #[arg(long)]
        tail: Option<u32>,

        /// Print history and exit
        #[arg(long)]
        no_follow: bool,
    },

    /// Run a shell command on an agent's host
    Exec {
        /// Agent host, optionally with :port
        host: String,

        /// Command line, run with the agent's shell
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("servertui={},tower_http={}", log_level, log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => ServerTuiConfig::load(path)?,
        None => ServerTuiConfig::default(),
    };

    match cli.command {
        Commands::Agent {
            host,
            port,
            interval_ms,
        } => run_agent(config, host, port, interval_ms).await,
        Commands::Watch { host, count } => watch_metrics(config, &host, count).await,
        Commands::Logs {
            host,
            target,
            tail,
            no_follow,
        } => tail_logs(config, &host, target, tail, !no_follow).await,
        Commands::Exec { host, command } => exec_command(config, &host, command.join(" ")).await,
        Commands::Config { default } => {
            let config = if default {
                ServerTuiConfig::default()
            } else {
                config
            };
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_agent(
    mut config: ServerTuiConfig,
    host: Option<String>,
    port: Option<u16>,
    interval_ms: Option<u64>,
) -> Result<()> {
    if let Some(host) = host {
        config.agent.host = host;
    }
    if let Some(port) = port {
        config.agent.port = port;
    }
    if let Some(interval_ms) = interval_ms {
        config.agent.metrics_interval_ms = interval_ms;
    }

    let server = Arc::new(AgentServerBuilder::new().config(config).build()?);
    let listener = server.bind().await?;
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tracing::info!("Agent is running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    tracing::info!("Shutting down...");
    server.shutdown();
    serving.await??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn watch_metrics(config: ServerTuiConfig, host: &str, count: Option<usize>) -> Result<()> {
    let supervisor = ConnectionSupervisor::new(&config);
    let host = supervisor.host_addr(host)?;
    let connection = supervisor.connect(&host).await?;
    if !supervisor.supports_direct_telemetry(&host).await {
        supervisor.shutdown().await;
        bail!("{} does not publish metrics", host);
    }

    let mut ticks = connection.subscribe_metrics().await?;
    let limit = count.unwrap_or(usize::MAX);
    let mut seen = 0;
    while seen < limit {
        let tick = tokio::select! {
            tick = ticks.next() => tick,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(tick) = tick else { break };
        println!(
            "{} cpu {:>5.1}%  mem {:>5.1}%  disk {:>5.1}%  rx {}  tx {}",
            chrono::DateTime::from_timestamp_millis(tick.timestamp)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
            tick.cpu.usage_percent,
            tick.memory.usage_percent,
            tick.disk.usage_percent,
            tick.network.bytes_recv,
            tick.network.bytes_sent,
        );
        seen += 1;
    }

    let state = connection.state();
    supervisor.shutdown().await;
    if seen < limit && count.is_some() {
        bail!("metrics stream ended early (connection {})", state);
    }
    Ok(())
}

async fn tail_logs(
    config: ServerTuiConfig,
    host: &str,
    target: String,
    tail: Option<u32>,
    follow: bool,
) -> Result<()> {
    let supervisor = ConnectionSupervisor::new(&config);
    let host = supervisor.host_addr(host)?;
    let connection = supervisor.connect(&host).await?;

    let mut request = StartStream::new(target);
    request.follow = follow;
    request.tail = tail;
    let mut stream = connection.stream_logs(request).await?;

    let mut failure = None;
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        match event {
            Some(StreamEvent::Details(details)) => {
                eprintln!("{} ({}) {} {}", details.name, details.id, details.image, details.state);
            }
            Some(StreamEvent::Line(line)) => println!("{}", line),
            Some(StreamEvent::Error(message)) => {
                eprintln!("error: {}", message);
                failure = Some(message);
            }
            Some(StreamEvent::Ended(reason)) => {
                tracing::debug!(reason = %reason, "Stream ended");
                break;
            }
            None => break,
        }
    }

    stream.stop().await;
    supervisor.shutdown().await;
    match failure {
        Some(message) => bail!(message),
        None => Ok(()),
    }
}

async fn exec_command(config: ServerTuiConfig, host: &str, command: String) -> Result<()> {
    let supervisor = ConnectionSupervisor::new(&config);
    let host = supervisor.host_addr(host)?;
    let connection = supervisor.connect(&host).await?;

    let queue = CommandQueue::new(config.console.queue_depth);
    let outcome = queue
        .run(Arc::new(connection), CommandAction::Exec { command })
        .await
        .with_context(|| format!("exec on {}", host));
    queue.close().await;
    supervisor.shutdown().await;

    let output = outcome?;
    if let Some(stdout) = output.get("stdout").and_then(|v| v.as_str()) {
        print!("{}", stdout);
    }
    if let Some(stderr) = output.get("stderr").and_then(|v| v.as_str()) {
        eprint!("{}", stderr);
    }
    let code = output.get("exitCode").and_then(|v| v.as_i64()).unwrap_or(0);
    if code != 0 {
        std::process::exit(code as i32);
    }
    Ok(())
}
