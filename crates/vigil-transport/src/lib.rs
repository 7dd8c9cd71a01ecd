//! WebSocket transport for Vigil's realtime channel.
//!
//! Provides the listener, the admission-gated HTTP upgrade, and the split
//! reader/writer halves a connection handler drives from two tasks.
//!
//! # Admission
//!
//! A browser presents its credential while upgrading, either as
//! `Authorization: Bearer <token>` or as a `?token=` query parameter.
//! The transport hands that to an [`Admission`] gate *inside* the
//! handshake. A rejected upgrade is answered with a plain HTTP error
//! status, so no WebSocket (and no connection object) ever exists for an
//! unauthenticated client.

mod error;
mod websocket;

pub use error::ConnectionError;
pub use websocket::{
    FrameReader, FrameWriter, Inbound, PendingConnection, TransportConfig,
    WebSocketConnection, WebSocketTransport, extract_credential,
};

use std::fmt;
use std::net::SocketAddr;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the gate gets to see about an upgrade request.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeRequest<'a> {
    /// Request path, already matched against [`TransportConfig::path`].
    pub path: &'a str,
    /// Bearer header value, falling back to the `token` query parameter.
    pub credential: Option<&'a str>,
    /// Remote socket address.
    pub peer: SocketAddr,
    /// `User-Agent` header, if any.
    pub user_agent: Option<&'a str>,
}

/// Why a gate refused an upgrade. Becomes the HTTP response status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    /// `401 Unauthorized`.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self {
            status: 401,
            reason: reason.into(),
        }
    }

    /// `404 Not Found`.
    pub fn not_found() -> Self {
        Self {
            status: 404,
            reason: "not found".into(),
        }
    }

    /// `503 Service Unavailable`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            status: 503,
            reason: reason.into(),
        }
    }
}

/// Decides whether an upgrade request may become a live connection.
///
/// Called synchronously from inside the WebSocket handshake, so
/// implementations must not block for long; validating a signed token and
/// doing an in-memory lookup is the intended workload.
///
/// `Identity` is whatever the gate learned about the client (user,
/// session, expiry). It is returned alongside the upgraded connection.
pub trait Admission: Send + Sync + 'static {
    /// Identity attached to an admitted connection.
    type Identity: Send + 'static;

    /// Admits or rejects one upgrade request.
    fn admit(&self, request: &UpgradeRequest<'_>) -> Result<Self::Identity, Rejection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ConnectionId::new(1), "alice");
        map.insert(ConnectionId::new(2), "bob");
        assert_eq!(map[&ConnectionId::new(1)], "alice");
    }

    #[test]
    fn test_rejection_helpers_set_status() {
        assert_eq!(Rejection::unauthorized("expired").status, 401);
        assert_eq!(Rejection::not_found().status, 404);
        assert_eq!(Rejection::unavailable("draining").status, 503);
    }
}
