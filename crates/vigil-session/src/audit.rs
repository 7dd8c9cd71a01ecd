//! Security audit events.
//!
//! The authority (and the account service built on it) reports
//! security-relevant actions through an [`AuditSink`]. Where they end up is
//! somebody else's problem; the default sink just logs them.

use chrono::{DateTime, Utc};
use vigil_protocol::{SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// A session was issued after a successful login.
    Login,
    /// A login attempt was refused.
    LoginFailed,
    /// A single session was revoked (logout or admin action).
    SessionRevoked,
    /// Every session of a user was revoked.
    AllSessionsRevoked,
    /// The expiry sweep removed dead rows.
    SessionsExpired,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::SessionRevoked => "session_revoked",
            Self::AllSessionsRevoked => "all_sessions_revoked",
            Self::SessionsExpired => "sessions_expired",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub at: DateTime<Utc>,
    pub user_id: Option<UserId>,
    pub username: Option<String>,
    pub session_id: Option<SessionId>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, at: DateTime<Utc>) -> Self {
        Self {
            action,
            at,
            user_id: None,
            username: None,
            session_id: None,
            detail: None,
        }
    }

    pub fn user(mut self, user_id: UserId, username: impl Into<String>) -> Self {
        self.user_id = Some(user_id);
        self.username = Some(username.into());
        self
    }

    pub fn user_id(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives audit events. Must not block.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events as `tracing` events on the `vigil::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "vigil::audit",
            action = event.action.as_str(),
            at = %event.at.to_rfc3339(),
            user_id = ?event.user_id.map(|u| u.to_string()),
            username = ?event.username,
            session_id = ?event.session_id.map(|s| s.to_string()),
            detail = ?event.detail,
            "audit"
        );
    }
}
