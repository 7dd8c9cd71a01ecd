//! Hub configuration, connection state machine, and close reasons.

use std::fmt;

// ---------------------------------------------------------------------------
// HubConfig
// ---------------------------------------------------------------------------

/// Configuration for the hub actor.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue bound per connection, in frames.
    ///
    /// A broadcast that finds a connection's queue full drops that
    /// connection instead of waiting. Default: 256.
    pub queue_capacity: usize,

    /// Bound of the hub's own command channel. Callers wait (briefly) when
    /// it is full. Default: 1024.
    pub command_capacity: usize,

    /// Broadcast `user_joined` / `user_left` when connections come and go.
    pub announce_presence: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            command_capacity: 1024,
            announce_presence: true,
        }
    }
}

impl HubConfig {
    /// Returns a copy with zero capacities raised to 1.
    pub fn validated(mut self) -> Self {
        if self.queue_capacity == 0 {
            tracing::warn!("hub queue_capacity was 0, using 1");
            self.queue_capacity = 1;
        }
        if self.command_capacity == 0 {
            tracing::warn!("hub command_capacity was 0, using 1");
            self.command_capacity = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// The lifecycle state of one realtime connection.
///
/// ```text
/// Connecting → Authenticated → Active → Closing → Closed
///                    │                     ↑
///                    └─────────────────────┘  (register failed)
/// ```
///
/// - **Connecting**: TCP accepted, upgrade in progress.
/// - **Authenticated**: the gate validated the token.
/// - **Active**: registered with the hub, receiving broadcasts.
/// - **Closing**: I/O error, heartbeat timeout, unregister, or revocation.
///   Always ends in `Closed`.
/// - **Closed**: socket closed, queue discarded, registry entry gone.
///   Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// The state reached on the success path, or `None` from `Closed`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::Authenticated),
            Self::Authenticated => Some(Self::Active),
            Self::Active => Some(Self::Closing),
            Self::Closing => Some(Self::Closed),
            Self::Closed => None,
        }
    }

    /// Returns `true` if moving to `target` is a legal transition.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.next() == Some(target)
            || (target == Self::Closing && matches!(self, Self::Authenticated))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticated => write!(f, "Authenticated"),
            Self::Active => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Why a connection was closed. Mapped to a WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or hung up.
    ClientClosed,
    /// The client sent something the server refuses to process.
    ProtocolError,
    /// No pong within the liveness window.
    HeartbeatTimeout,
    /// The outbound queue filled up.
    SlowConsumer,
    /// The backing session was revoked.
    SessionRevoked,
    /// The backing session reached `expires_at`.
    SessionExpired,
    /// The server is shutting down.
    ServerShutdown,
    /// Writing to the socket failed or timed out.
    WriteFailed,
}

impl CloseReason {
    /// WebSocket close code sent to the client.
    pub fn close_code(self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::ServerShutdown => 1001,
            Self::ProtocolError => 1002,
            Self::WriteFailed => 1011,
            Self::SessionRevoked => 4001,
            Self::SessionExpired => 4002,
            Self::HeartbeatTimeout => 4003,
            Self::SlowConsumer => 4008,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client closed",
            Self::ProtocolError => "protocol error",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SlowConsumer => "slow consumer",
            Self::SessionRevoked => "session revoked",
            Self::SessionExpired => "session expired",
            Self::ServerShutdown => "server shutdown",
            Self::WriteFailed => "write failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
