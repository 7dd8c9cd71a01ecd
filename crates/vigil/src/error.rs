//! Top-level error type that wraps all sub-crate errors.

use vigil_hub::HubError;
use vigil_protocol::ProtocolError;
use vigil_session::AuthError;
use vigil_telemetry::SamplingError;
use vigil_transport::ConnectionError;

use crate::accounts::AccountError;
use crate::config::ConfigError;

/// Unified error type for the Vigil server.
///
/// Each variant wraps an error from a specific layer. The `#[from]`
/// attribute means `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
