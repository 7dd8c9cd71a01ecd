//! Realtime admission: the WebSocket upgrade is accepted only for a token
//! the session authority validates.

use std::sync::Arc;
use std::time::Duration;

use vigil_session::{AuthError, Principal, RevocationListener, SessionAuthority, SessionStore};
use vigil_transport::{Admission, Rejection, UpgradeRequest};

/// What an admitted connection knows about its session.
#[derive(Debug, Clone)]
pub struct AdmittedSession {
    pub principal: Principal,
    /// Time left before the session's `expires_at`, measured at admission
    /// on the authority's clock.
    pub expires_in: Duration,
}

/// [`Admission`] gate backed by [`SessionAuthority::validate_credential`].
pub struct SessionGate<S, L> {
    authority: Arc<SessionAuthority<S, L>>,
}

impl<S, L> SessionGate<S, L> {
    pub fn new(authority: Arc<SessionAuthority<S, L>>) -> Self {
        Self { authority }
    }
}

impl<S: SessionStore, L: RevocationListener> Admission for SessionGate<S, L> {
    type Identity = AdmittedSession;

    fn admit(&self, request: &UpgradeRequest<'_>) -> Result<AdmittedSession, Rejection> {
        match self.authority.validate_credential(request.credential) {
            Ok(principal) => {
                let expires_in = (principal.expires_at - self.authority.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Ok(AdmittedSession {
                    principal,
                    expires_in,
                })
            }
            Err(e) => {
                tracing::debug!(peer = %request.peer, error = %e, "realtime upgrade refused");
                Err(rejection_for(&e))
            }
        }
    }
}

fn rejection_for(error: &AuthError) -> Rejection {
    if error.is_client_error() {
        Rejection::unauthorized(error.code())
    } else {
        Rejection::unavailable(error.code())
    }
}
