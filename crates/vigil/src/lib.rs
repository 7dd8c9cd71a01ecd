//! # Vigil
//!
//! Authenticated real-time telemetry hub for server-administration
//! dashboards.
//!
//! Browsers log in over REST, receive a signed session token, and open a
//! WebSocket presenting it. Admitted connections are registered with the
//! hub, which fans out `system_stats` snapshots from the telemetry
//! publisher (plus presence and notification messages) to every live
//! connection. Revoking a session (logout, password change, account
//! deactivation) closes the connections that depend on it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vigil::prelude::*;
//!
//! # async fn start() -> Result<(), VigilError> {
//! let server = VigilServer::builder()
//!     .config(ServerConfig::from_env()?)
//!     .build()
//!     .await?;
//! server.run(CancellationToken::new()).await
//! # }
//! ```

pub mod accounts;
pub mod api;
pub mod config;
mod error;
pub mod gate;
pub mod handler;
pub mod logging;
pub mod server;

pub use error::VigilError;

/// Commonly used types from every layer.
pub mod prelude {
    pub use tokio_util::sync::CancellationToken;
    pub use vigil_hub::{CloseReason, ConnectionState, HubConfig, HubHandle};
    pub use vigil_protocol::{
        Message, MessageKind, Notification, NotificationLevel, Payload, SessionId, SystemSnapshot,
        UserId,
    };
    pub use vigil_session::{AuthError, Principal, RevocationReason, SessionConfig};
    pub use vigil_telemetry::{MetricsSampler, ProcfsSampler, SamplingError};

    pub use crate::VigilError;
    pub use crate::accounts::{AccountError, PasswordHashing, UserProfile};
    pub use crate::config::ServerConfig;
    pub use crate::handler::HandlerConfig;
    pub use crate::server::{Accounts, Authority, VigilServer, VigilServerBuilder};
}
