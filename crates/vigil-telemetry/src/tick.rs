//! The publisher's clock.
//!
//! Each call to [`TickScheduler::wait_for_tick`] sleeps until the next
//! sample is due. A tick that fires late (the previous sample ran long)
//! does not try to catch up: the missed ticks are counted and the next one
//! is scheduled a full interval after the late one, so the hub never sees
//! a burst of back-to-back snapshots.

use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};

/// A sample taking at least this share of the interval is logged.
const SLOW_SAMPLE_SHARE: f64 = 0.8;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Time between samples.
    ///
    /// Default: 5 seconds.
    pub interval: Duration,

    /// The first tick is pushed back by a random amount below this, so
    /// servers restarted together don't sample in step. Later ticks are
    /// unaffected.
    ///
    /// Default: none.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            initial_jitter: Duration::ZERO,
        }
    }
}

impl TickConfig {
    /// Smallest interval the scheduler accepts.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Returns a copy with the interval raised to [`Self::MIN_INTERVAL`]
    /// and the jitter capped at one interval.
    pub fn validated(mut self) -> Self {
        if self.interval < Self::MIN_INTERVAL {
            tracing::warn!(
                interval_ms = self.interval.as_millis() as u64,
                "telemetry interval below minimum, using {}ms",
                Self::MIN_INTERVAL.as_millis()
            );
            self.interval = Self::MIN_INTERVAL;
        }
        if self.initial_jitter > self.interval {
            self.initial_jitter = self.interval;
        }
        self
    }

    /// A random delay in `[0, initial_jitter)` at microsecond resolution.
    /// Anything under a microsecond is no jitter at all.
    fn first_delay(&self) -> Duration {
        let bound = self.initial_jitter.as_micros() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..bound))
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One fired tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInfo {
    /// Starts at 1.
    pub tick: u64,
    /// Fired more than a tenth of an interval after its deadline.
    pub late: bool,
    /// Whole intervals that passed without a tick.
    pub skipped: u64,
}

/// Running totals, reported when the publisher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickMetrics {
    pub ticks: u64,
    pub late: u64,
    pub skipped: u64,
    /// Longest time from a tick firing to [`TickScheduler::finish_tick`].
    pub slowest: Duration,
}

pub struct TickScheduler {
    config: TickConfig,
    deadline: Instant,
    started: Option<Instant>,
    metrics: TickMetrics,
}

impl TickScheduler {
    /// The first tick is due one interval (plus jitter) from now.
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let jitter = config.first_delay();
        tracing::debug!(
            interval_ms = config.interval.as_millis() as u64,
            jitter_us = jitter.as_micros() as u64,
            "tick scheduler created"
        );
        Self {
            deadline: Instant::now() + config.interval + jitter,
            config,
            started: None,
            metrics: TickMetrics::default(),
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self::new(TickConfig::with_interval(interval))
    }

    pub async fn wait_for_tick(&mut self) -> TickInfo {
        let due = self.deadline;
        let interval = self.config.interval;
        time::sleep_until(due).await;

        let now = Instant::now();
        let behind = now.saturating_duration_since(due);
        let late = behind > interval / 10;
        let skipped = if late {
            (behind.as_nanos() / interval.as_nanos()) as u64
        } else {
            0
        };

        self.metrics.ticks += 1;
        self.metrics.late += u64::from(late);
        self.metrics.skipped += skipped;
        self.deadline = now + interval;
        self.started = Some(now);

        if skipped > 0 {
            tracing::warn!(
                tick = self.metrics.ticks,
                skipped,
                behind_ms = behind.as_millis() as u64,
                "telemetry tick late, skipping missed samples"
            );
        }

        TickInfo {
            tick: self.metrics.ticks,
            late,
            skipped,
        }
    }

    /// Marks the current tick's sample as done.
    pub fn finish_tick(&mut self) {
        let Some(started) = self.started.take() else {
            return;
        };
        let took = started.elapsed();
        self.metrics.slowest = self.metrics.slowest.max(took);
        if took.as_secs_f64() >= self.config.interval.as_secs_f64() * SLOW_SAMPLE_SHARE {
            tracing::warn!(
                tick = self.metrics.ticks,
                took_ms = took.as_millis() as u64,
                interval_ms = self.config.interval.as_millis() as u64,
                "telemetry sample used most of its interval"
            );
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn metrics(&self) -> TickMetrics {
        self.metrics
    }
}
