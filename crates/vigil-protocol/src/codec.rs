//! Codec trait and the JSON implementation.
//!
//! Browsers consume the realtime channel as text frames, so the codec
//! works on `String`/`&str` rather than raw bytes. The hub encodes each
//! broadcast exactly once and shares the resulting frame between every
//! connection queue.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Converts values to and from text frames.
///
/// - `Send + Sync` → one codec instance is shared by every connection task.
/// - `'static` → it lives as long as the server.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into a text frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if the value can't be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError>;

    /// Parses a text frame back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the frame is malformed or
    /// doesn't match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &str) -> Result<T, ProtocolError>;
}

/// A [`Codec`] backed by `serde_json`.
///
/// ```rust
/// use vigil_protocol::{Codec, JsonCodec, Message, MessageKind};
///
/// let codec = JsonCodec;
/// let frame = codec.encode(&Message::ping()).unwrap();
/// let back: Message = codec.decode(&frame).unwrap();
/// assert_eq!(back.kind, MessageKind::Ping);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError> {
        serde_json::to_string(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &str) -> Result<T, ProtocolError> {
        serde_json::from_str(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, MessageKind};

    #[test]
    fn test_decode_garbage_returns_decode_error() {
        let result: Result<Message, _> = JsonCodec.decode("not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_unknown_kind_returns_decode_error() {
        let frame = r#"{"type":"reboot_server","data":null,"timestamp":"2026-01-01T00:00:00Z"}"#;
        let result: Result<Message, _> = JsonCodec.decode(frame);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_browser_ping_without_data_or_timestamp() {
        // Browsers send the bare minimum; everything but `type` is optional.
        let msg: Message = JsonCodec.decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Ping);
        assert!(msg.user_id.is_none());
    }
}
