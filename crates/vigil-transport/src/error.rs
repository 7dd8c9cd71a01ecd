/// Errors raised while accepting, upgrading, or driving one connection.
///
/// These are always local to a single connection: the handler that hits
/// one unregisters its own connection and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Binding or accepting a TCP connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// The HTTP upgrade to WebSocket didn't complete (bad request, I/O
    /// error, or the handshake timed out).
    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    /// The admission gate refused the upgrade.
    #[error("upgrade rejected with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    /// No liveness signal arrived within the timeout window.
    #[error("read timed out")]
    ReadTimeout,

    /// A frame couldn't be written within the write timeout.
    #[error("write timed out")]
    WriteTimeout,

    /// The connection's outbound queue was full.
    #[error("outbound queue full")]
    QueueFull,

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}
