//! Telemetry for Vigil: sample the host on a fixed interval and broadcast
//! each sample as a `system_stats` message.
//!
//! - [`TickScheduler`]: fixed-interval timer with overrun handling
//! - [`MetricsSampler`]: the injected sampling function; [`ProcfsSampler`]
//!   is the Linux implementation
//! - [`TelemetryPublisher`]: the loop tying the two to the hub
//!
//! A failed sample is logged and skipped. Nothing short of cancellation
//! stops the publisher.

mod publisher;
mod sampler;
mod tick;

pub use publisher::{PublisherConfig, PublisherStats, TelemetryPublisher};
pub use sampler::{MetricsSampler, ProcfsSampler, SamplingError};
pub use tick::{TickConfig, TickInfo, TickMetrics, TickScheduler};
