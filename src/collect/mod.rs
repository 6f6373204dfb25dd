//! Data-gathering collaborators
//!
//! The channel never samples, inspects or executes anything itself. It
//! consumes typed values through the traits in this module. The crate ships
//! thin host adapters ([`SysinfoMetrics`], [`DockerCli`], [`HostExecutor`])
//! so the agent binary is usable out of the box; tests substitute fakes.

mod docker;
mod shell;
mod system;
mod types;
mod updates;

pub use docker::DockerCli;
pub use shell::HostExecutor;
pub use system::SysinfoMetrics;
pub use types::{
    CommandOutput, ContainerDetails, ContainerSummary, CpuMetrics, DiskMetrics, LogOptions,
    MemoryMetrics, MetricsSnapshot, NetworkMetrics, SystemInfo,
};
pub use updates::{PackageManager, PackageUpdater};

use crate::error::Result;
use crate::protocol::CommandAction;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Lines of a followed log, in source order
pub type LineStream = BoxStream<'static, Result<String>>;

/// Source of host metrics
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Take one metrics snapshot
    async fn sample(&self) -> Result<MetricsSnapshot>;

    /// Static host information
    async fn system_info(&self) -> Result<SystemInfo>;
}

/// Source of workload log lines
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Open a line feed for `target`.
    ///
    /// The stream ends when the source ends or `cancel` fires. Dropping the
    /// stream must release whatever the source holds open.
    async fn follow(
        &self,
        target: &str,
        options: &LogOptions,
        cancel: CancellationToken,
    ) -> Result<LineStream>;
}

/// Inspection of workloads
#[async_trait]
pub trait ResourceInspector: Send + Sync {
    /// Details of a single container
    async fn describe(&self, target: &str) -> Result<ContainerDetails>;

    /// Every container on the host, running or not
    async fn list(&self) -> Result<Vec<ContainerSummary>>;
}

/// Executes one-shot command actions.
///
/// The caller owns the deadline: it drops the returned future when the
/// action's timeout elapses, so implementations must release child
/// processes on drop.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, action: &CommandAction) -> Result<serde_json::Value>;
}
