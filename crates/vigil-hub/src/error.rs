//! Error types for the hub.

use vigil_protocol::ProtocolError;
use vigil_transport::ConnectionId;

/// Errors that can occur during hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A connection with this id is already registered.
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    /// The hub's actor has stopped (shutdown or crash).
    #[error("hub is unavailable")]
    Unavailable,

    /// A message couldn't be encoded for broadcast.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
