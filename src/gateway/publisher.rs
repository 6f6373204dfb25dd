//! Unsolicited metrics ticks

use super::relay::Relay;
use crate::collect::MetricsSource;
use crate::protocol::AgentEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts reported when a publisher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherReport {
    pub published: u64,
    pub skipped: u64,
}

/// Pushes a metrics snapshot immediately and then every interval
pub struct MetricsPublisher {
    source: Arc<dyn MetricsSource>,
    interval: Duration,
}

impl MetricsPublisher {
    pub fn new(source: Arc<dyn MetricsSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Run until `cancel` fires or the writer goes away.
    ///
    /// A failed sample skips that tick only.
    pub async fn run(self, relay: Relay, cancel: CancellationToken) -> PublisherReport {
        let mut report = PublisherReport::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sample = tokio::select! {
                _ = cancel.cancelled() => break,
                sample = self.source.sample() => sample,
            };

            match sample {
                Ok(snapshot) => {
                    if !relay
                        .send_stream(AgentEvent::Metrics(snapshot), Some(&cancel))
                        .await
                    {
                        break;
                    }
                    report.published += 1;
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(error = %e, "Metrics sample failed, skipping tick");
                }
            }
        }

        tracing::debug!(
            published = report.published,
            skipped = report.skipped,
            "Metrics publisher stopped"
        );
        report
    }
}
