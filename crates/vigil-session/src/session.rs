//! Session types: the persisted row and the values that flow in and out of
//! the authority.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_protocol::{SessionId, UserId};

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of an issued token and its session row.
    ///
    /// Default: 24 hours.
    pub token_ttl: Duration,

    /// Value of the `iss` claim; tokens from another issuer are rejected.
    pub issuer: String,

    /// How often the expiry sweep deletes dead rows.
    ///
    /// Default: 5 minutes.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(24 * 60 * 60),
            issuer: "vigil".to_string(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Longest `token_ttl` the authority accepts.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl SessionConfig {
    /// Returns a copy with zero durations raised to one second and
    /// `token_ttl` capped at [`MAX_TOKEN_TTL`].
    pub fn validated(mut self) -> Self {
        if self.token_ttl.is_zero() {
            tracing::warn!("session token_ttl was 0, using 1s");
            self.token_ttl = Duration::from_secs(1);
        }
        if self.token_ttl > MAX_TOKEN_TTL {
            tracing::warn!(
                requested = ?self.token_ttl,
                max = ?MAX_TOKEN_TTL,
                "session token_ttl above maximum, capping"
            );
            self.token_ttl = MAX_TOKEN_TTL;
        }
        if self.sweep_interval.is_zero() {
            tracing::warn!("session sweep_interval was 0, using 1s");
            self.sweep_interval = Duration::from_secs(1);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The server's record of one login.
///
/// A session is valid iff its row exists in the store AND
/// `now < expires_at`. The token itself is never stored, only its SHA-256
/// hash, so a leaked store can't be replayed as credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(skip_serializing)]
    pub token_hash: String,
}

impl Session {
    /// Whether the row's own expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Who a session is being issued for. Produced by credential checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub username: String,
}

/// Where a login came from. Recorded on the row, never validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// What `issue_session` hands back to the login flow.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
}

/// A successfully validated caller.
///
/// Carried by REST requests (in axum extensions) and by admitted realtime
/// connections, which use `expires_at` to close themselves when the
/// session runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_validated_clamps_zero_durations() {
        let cfg = SessionConfig {
            token_ttl: Duration::ZERO,
            sweep_interval: Duration::ZERO,
            ..SessionConfig::default()
        }
        .validated();
        assert_eq!(cfg.token_ttl, Duration::from_secs(1));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_session_config_validated_caps_token_ttl() {
        let cfg = SessionConfig {
            token_ttl: Duration::MAX,
            ..SessionConfig::default()
        }
        .validated();
        assert_eq!(cfg.token_ttl, MAX_TOKEN_TTL);

        let day = SessionConfig::default().validated();
        assert_eq!(day.token_ttl, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_session_is_expired_at_boundary() {
        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            user_id: UserId::new(),
            username: "alice".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(10),
            ip: None,
            user_agent: None,
            token_hash: String::new(),
        };
        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_session_serialization_omits_token_hash() {
        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            user_id: UserId::new(),
            username: "alice".into(),
            issued_at: now,
            expires_at: now,
            ip: Some("10.0.0.1".into()),
            user_agent: None,
            token_hash: "deadbeef".into(),
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("deadbeef"));
        assert!(json.contains("10.0.0.1"));
    }
}
