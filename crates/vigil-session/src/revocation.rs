//! Revocation notifications.
//!
//! Deleting a session row stops *new* requests from authenticating, but a
//! realtime connection admitted earlier is still open. The authority tells
//! a [`RevocationListener`] (the hub) after every revoke so those
//! connections are closed too.

use std::future::Future;

use vigil_protocol::{SessionId, UserId};

/// What was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    Session(SessionId),
    User(UserId),
}

/// Why it was revoked. Recorded in audit and carried to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Logout,
    PasswordChanged,
    AccountDisabled,
    Administrative,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::PasswordChanged => "password_changed",
            Self::AccountDisabled => "account_disabled",
            Self::Administrative => "administrative",
        }
    }
}

/// Reacts to revoked sessions.
///
/// Called after the rows are gone, so a listener that re-validates a token
/// will already see `Revoked`.
pub trait RevocationListener: Send + Sync + 'static {
    fn on_revoked(
        &self,
        revocation: Revocation,
        reason: RevocationReason,
    ) -> impl Future<Output = ()> + Send;
}

/// Listener that does nothing. The default until a hub is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl RevocationListener for NoopListener {
    async fn on_revoked(&self, _revocation: Revocation, _reason: RevocationReason) {}
}
