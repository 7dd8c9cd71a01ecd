//! Wire protocol for Vigil's realtime channel.
//!
//! This crate defines what travels between the dashboard server and the
//! browser once a realtime connection is open:
//!
//! - **Identity** ([`UserId`], [`SessionId`]): the identifiers shared by
//!   the session layer, the hub, and the wire format.
//! - **Messages** ([`Message`], [`MessageKind`], [`Payload`]): the
//!   JSON object `{ type, data, timestamp, user_id?, username? }`.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how messages become
//!   text frames and back.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (frames) → Protocol (Message) → Hub (fan-out)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    CpuStats, DiskStats, ErrorPayload, LoadAverage, MemoryStats, Message,
    MessageKind, Notification, NotificationLevel, Payload, Presence,
    SessionId, SystemSnapshot, UserId,
};
