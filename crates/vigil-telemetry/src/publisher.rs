//! The telemetry publisher: tick, sample, broadcast.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vigil_hub::{HubError, HubHandle};
use vigil_protocol::Message;

use crate::{MetricsSampler, SamplingError, TickConfig, TickScheduler};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub tick: TickConfig,
    /// A sample still running after this long counts as failed.
    /// Clamped to the tick interval.
    pub sample_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            tick: TickConfig::default(),
            sample_timeout: Duration::from_secs(2),
        }
    }
}

impl PublisherConfig {
    pub fn validated(mut self) -> Self {
        self.tick = self.tick.validated();
        if self.sample_timeout.is_zero() || self.sample_timeout > self.tick.interval {
            self.sample_timeout = self.tick.interval;
        }
        self
    }
}

/// Counters returned when the publisher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub ticks: u64,
    pub published: u64,
    pub failures: u64,
}

/// Samples host metrics on a fixed interval and broadcasts each snapshot
/// as a `system_stats` message.
pub struct TelemetryPublisher<M> {
    sampler: M,
    hub: HubHandle,
    config: PublisherConfig,
}

impl<M: MetricsSampler> TelemetryPublisher<M> {
    pub fn new(sampler: M, hub: HubHandle, config: PublisherConfig) -> Self {
        Self {
            sampler,
            hub,
            config: config.validated(),
        }
    }

    /// Runs until `cancel` fires or the hub goes away.
    ///
    /// A failed or timed-out sample is logged and skipped; the next tick
    /// samples again.
    pub async fn run(self, cancel: CancellationToken) -> PublisherStats {
        let mut scheduler = TickScheduler::new(self.config.tick.clone());
        let mut stats = PublisherStats::default();

        tracing::info!(
            interval_ms = scheduler.interval().as_millis() as u64,
            "telemetry publisher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                info = scheduler.wait_for_tick() => {
                    stats.ticks += 1;
                    let outcome = self.publish_once().await;
                    scheduler.finish_tick();

                    match outcome {
                        Ok(()) => stats.published += 1,
                        Err(PublishFailure::Sampling(e)) => {
                            stats.failures += 1;
                            tracing::warn!(tick = info.tick, error = %e, "sample failed, skipping tick");
                        }
                        Err(PublishFailure::Hub(HubError::Unavailable)) => {
                            tracing::error!("hub unavailable, telemetry publisher stopping");
                            break;
                        }
                        Err(PublishFailure::Hub(e)) => {
                            stats.failures += 1;
                            tracing::warn!(tick = info.tick, error = %e, "broadcast failed");
                        }
                    }
                }
            }
        }

        let timing = scheduler.metrics();
        tracing::info!(
            ticks = stats.ticks,
            published = stats.published,
            failures = stats.failures,
            late = timing.late,
            skipped = timing.skipped,
            slowest_ms = timing.slowest.as_millis() as u64,
            "telemetry publisher stopped"
        );
        stats
    }

    async fn publish_once(&self) -> Result<(), PublishFailure> {
        let timeout = self.config.sample_timeout;
        let snapshot = tokio::time::timeout(timeout, self.sampler.sample())
            .await
            .map_err(|_| PublishFailure::Sampling(SamplingError::Timeout(timeout)))?
            .map_err(PublishFailure::Sampling)?;

        let report = self
            .hub
            .broadcast(&Message::system_stats(&snapshot))
            .await
            .map_err(PublishFailure::Hub)?;
        tracing::trace!(
            delivered = report.delivered,
            evicted = report.evicted,
            "system_stats published"
        );
        Ok(())
    }
}

enum PublishFailure {
    Sampling(SamplingError),
    Hub(HubError),
}
