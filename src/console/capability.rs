//! Telemetry source selection

use crate::protocol::{Capability, HealthReport};

/// Where a console should read host telemetry from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryStrategy {
    /// Subscribe to the agent's metrics ticks
    DirectAgent,
    /// Poll over the secure-shell collaborator
    ShellFallback,
}

impl TelemetryStrategy {
    /// Direct only when a healthy agent advertises metrics
    pub fn select(health: Option<&HealthReport>) -> Self {
        match health {
            Some(report) if report.is_ok() && report.supports(Capability::Metrics) => {
                Self::DirectAgent
            }
            _ => Self::ShellFallback,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::DirectAgent)
    }
}
