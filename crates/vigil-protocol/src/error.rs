//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust value into a text frame).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed.
    ///
    /// Common causes: malformed JSON, an unknown `type` tag, or a `data`
    /// field that doesn't match the payload shape for its kind.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message parsed but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
