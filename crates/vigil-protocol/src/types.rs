//! Core protocol types for the realtime wire format.
//!
//! Every value in this module is something the server sends to (or
//! receives from) a browser, or an identifier that several layers agree on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies a user account.
///
/// A newtype over `Uuid` so it can't be confused with a [`SessionId`]
/// even though both are UUIDs underneath. `#[serde(transparent)]` keeps
/// the wire form a plain string: `"user_id": "6f1c…"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Generates a fresh random user id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one login session.
///
/// Embedded in the signed token's claims and recorded against every live
/// connection so that revoking the session can find its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageKind: the closed set of `type` tags
// ---------------------------------------------------------------------------

/// The `type` tag of a [`Message`].
///
/// The set is closed: a frame with any other tag fails to decode instead
/// of being passed around as an unknown string. `rename_all` gives the
/// wire spelling (`"system_stats"`, `"user_joined"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Periodic CPU/memory/disk/load snapshot.
    SystemStats,
    /// A user opened a realtime connection.
    UserJoined,
    /// A user's realtime connection closed.
    UserLeft,
    /// A human-readable notice pushed by some other part of the system.
    Notification,
    /// Something went wrong; `data` carries a code and message.
    Error,
    /// Application-level keepalive.
    Ping,
    /// Reply to [`MessageKind::Ping`].
    Pong,
}

impl MessageKind {
    /// The wire spelling of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemStats => "system_stats",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::Notification => "notification",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// CPU usage at sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Busy percentage across all cores since the previous sample.
    pub usage_percent: f64,
    /// Number of logical cores.
    pub cores: u32,
}

/// Physical memory usage, in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

/// Usage of one mounted filesystem, in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

/// 1, 5 and 15 minute load averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// One telemetry sample, carried by [`MessageKind::SystemStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub uptime_secs: u64,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disk: Vec<DiskStats>,
    pub load: LoadAverage,
}

/// Carried by [`MessageKind::UserJoined`] and [`MessageKind::UserLeft`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub username: String,
}

/// Severity of a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

/// Carried by [`MessageKind::Notification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub level: NotificationLevel,
}

/// Carried by [`MessageKind::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// The decoded `data` of a [`Message`], one variant per [`MessageKind`].
///
/// Produced by [`Message::payload`]. Matching on this is exhaustive, so
/// adding a kind forces every consumer to handle it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    SystemStats(SystemSnapshot),
    UserJoined(Presence),
    UserLeft(Presence),
    Notification(Notification),
    Error(ErrorPayload),
    Ping,
    Pong,
}

// ---------------------------------------------------------------------------
// Message: the wire envelope
// ---------------------------------------------------------------------------

/// One realtime message.
///
/// Serializes as:
///
/// ```json
/// { "type": "system_stats", "data": { ... }, "timestamp": "2026-01-01T00:00:00Z",
///   "user_id": "…", "username": "alice" }
/// ```
///
/// `user_id`/`username` are omitted when the message isn't attributed to
/// anyone. A message is immutable once built; the hub shares one encoded
/// copy between every recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Message {
    fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            user_id: None,
            username: None,
        }
    }

    /// Builds a message from a typed payload.
    ///
    /// Payload structs only hold strings, numbers and vectors, so
    /// `to_value` can't fail for them; a failure would still surface as a
    /// null `data` rather than a panic.
    fn with_payload<T: Serialize>(kind: MessageKind, payload: &T) -> Self {
        Self::new(kind, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    pub fn system_stats(snapshot: &SystemSnapshot) -> Self {
        Self::with_payload(MessageKind::SystemStats, snapshot)
    }

    /// A `user_joined` message, attributed to the joining user.
    pub fn user_joined(user_id: UserId, username: impl Into<String>) -> Self {
        let presence = Presence {
            user_id,
            username: username.into(),
        };
        Self::with_payload(MessageKind::UserJoined, &presence)
            .with_user(user_id, presence.username)
    }

    /// A `user_left` message, attributed to the departing user.
    pub fn user_left(user_id: UserId, username: impl Into<String>) -> Self {
        let presence = Presence {
            user_id,
            username: username.into(),
        };
        Self::with_payload(MessageKind::UserLeft, &presence)
            .with_user(user_id, presence.username)
    }

    pub fn notification(notification: &Notification) -> Self {
        Self::with_payload(MessageKind::Notification, notification)
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::with_payload(
            MessageKind::Error,
            &ErrorPayload {
                code,
                message: message.into(),
            },
        )
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Value::Null)
    }

    /// Attributes the message to a user.
    pub fn with_user(mut self, user_id: UserId, username: impl Into<String>) -> Self {
        self.user_id = Some(user_id);
        self.username = Some(username.into());
        self
    }

    /// Decodes `data` into the typed [`Payload`] for this message's kind.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if `data` doesn't have the shape
    /// the kind requires.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        fn typed<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, ProtocolError> {
            T::deserialize(data).map_err(ProtocolError::Decode)
        }

        Ok(match self.kind {
            MessageKind::SystemStats => Payload::SystemStats(typed(&self.data)?),
            MessageKind::UserJoined => Payload::UserJoined(typed(&self.data)?),
            MessageKind::UserLeft => Payload::UserLeft(typed(&self.data)?),
            MessageKind::Notification => Payload::Notification(typed(&self.data)?),
            MessageKind::Error => Payload::Error(typed(&self.data)?),
            MessageKind::Ping => Payload::Ping,
            MessageKind::Pong => Payload::Pong,
        })
    }
}
