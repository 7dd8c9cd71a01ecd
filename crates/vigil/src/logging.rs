//! Tracing subscriber setup for the `vigild` binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset. `vigil` also covers the audit target.
pub const DEFAULT_FILTER: &str =
    "vigil=info,vigil_hub=info,vigil_session=info,vigil_telemetry=info,vigil_transport=info";

/// Installs the global subscriber: `RUST_LOG` filter plus the fmt layer.
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
