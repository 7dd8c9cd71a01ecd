//! The Session Authority: issues, validates, and revokes sessions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_protocol::{SessionId, UserId};

use crate::{
    AuditAction, AuditEvent, AuditSink, AuthError, Claims, ClientInfo, Clock, IssuedSession,
    MemorySessionStore, NoopListener, Principal, Revocation, RevocationListener,
    RevocationReason, Session, SessionConfig, SessionStore, SystemClock, TokenSigner,
    TracingAuditSink, UserIdentity, hash_token,
};

/// Issues and validates time-bound credentials and owns the session rows.
///
/// Shared as `Arc<SessionAuthority<..>>` between the REST layer, the
/// realtime gate, and the expiry sweep task.
///
/// ## Validation is two-layered
///
/// ```text
/// token ──→ signature + issuer ──→ exp > now ──→ row exists ──→ row.expires_at > now ──→ Principal
///               │                     │              │                    │
///           Malformed              Expired        Revoked              Expired
/// ```
///
/// The signature check alone can't express revocation before natural
/// expiry; the row check alone loses tamper-evidence. Both always run.
pub struct SessionAuthority<S = MemorySessionStore, L = NoopListener> {
    store: S,
    listener: L,
    signer: TokenSigner,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl SessionAuthority {
    /// Creates an authority with an in-memory store, the system clock,
    /// tracing audit, and no revocation listener.
    pub fn new(secret: &[u8], config: SessionConfig) -> Self {
        let config = config.validated();
        Self {
            store: MemorySessionStore::new(),
            listener: NoopListener,
            signer: TokenSigner::new(secret, &config.issuer),
            config,
            clock: Arc::new(SystemClock),
            audit: Arc::new(TracingAuditSink),
        }
    }
}

impl<S: SessionStore, L: RevocationListener> SessionAuthority<S, L> {
    /// Replaces the session store.
    pub fn with_store<S2: SessionStore>(self, store: S2) -> SessionAuthority<S2, L> {
        SessionAuthority {
            store,
            listener: self.listener,
            signer: self.signer,
            config: self.config,
            clock: self.clock,
            audit: self.audit,
        }
    }

    /// Attaches the listener told about every revocation (normally the hub).
    pub fn with_listener<L2: RevocationListener>(self, listener: L2) -> SessionAuthority<S, L2> {
        SessionAuthority {
            store: self.store,
            listener,
            signer: self.signer,
            config: self.config,
            clock: self.clock,
            audit: self.audit,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current time according to the authority's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The audit sink, for collaborators (login flow) that record their
    /// own events.
    pub fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    // -----------------------------------------------------------------------
    // Issue
    // -----------------------------------------------------------------------

    /// Creates and persists a session for `user` and returns its token.
    ///
    /// # Errors
    /// [`AuthError::Signing`] or [`AuthError::Store`]; nothing is persisted
    /// if signing fails.
    pub fn issue_session(
        &self,
        user: &UserIdentity,
        client: ClientInfo,
    ) -> Result<IssuedSession, AuthError> {
        let issued_at = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.token_ttl)
            .map_err(|e| AuthError::Signing(format!("token ttl out of range: {e}")))?;
        let expires_at = issued_at
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::Signing("token expiry out of range".into()))?;
        let session_id = SessionId::new();

        let claims = Claims {
            sub: user.user_id.to_string(),
            sid: session_id.to_string(),
            username: user.username.clone(),
            iss: self.config.issuer.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = self.signer.sign(&claims)?;

        self.store.insert(Session {
            id: session_id,
            user_id: user.user_id,
            username: user.username.clone(),
            issued_at,
            expires_at,
            ip: client.ip,
            user_agent: client.user_agent,
            token_hash: hash_token(&token),
        })?;

        tracing::info!(%session_id, user_id = %user.user_id, %expires_at, "session issued");
        self.audit.record(
            AuditEvent::new(AuditAction::Login, issued_at)
                .user(user.user_id, user.username.clone())
                .session(session_id),
        );

        Ok(IssuedSession {
            token,
            session_id,
            expires_at,
        })
    }

    // -----------------------------------------------------------------------
    // Validate
    // -----------------------------------------------------------------------

    /// Validates a presented credential.
    ///
    /// `None` or an empty string is [`AuthError::NotFound`].
    pub fn validate_credential(&self, credential: Option<&str>) -> Result<Principal, AuthError> {
        match credential {
            Some(token) => self.validate_token(token),
            None => Err(AuthError::NotFound),
        }
    }

    /// Verifies a token's signature and expiry, then confirms its session
    /// row still exists and is unexpired.
    ///
    /// Synchronous: the realtime gate calls this from inside the WebSocket
    /// handshake.
    pub fn validate_token(&self, token: &str) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::NotFound);
        }

        let claims = self.signer.verify(token)?;
        let now = self.clock.now();
        if now.timestamp() >= claims.exp {
            return Err(AuthError::Expired);
        }

        let session_id = parse_uuid(&claims.sid, "sid").map(SessionId)?;
        let user_id = parse_uuid(&claims.sub, "sub").map(UserId)?;

        // Signature was good, so a missing row means it was revoked.
        let Some(session) = self.store.get(session_id)? else {
            return Err(AuthError::Revoked);
        };
        if session.user_id != user_id || session.token_hash != hash_token(token) {
            return Err(AuthError::Revoked);
        }
        if session.is_expired_at(now) {
            return Err(AuthError::Expired);
        }

        Ok(Principal {
            user_id,
            session_id,
            username: session.username,
            expires_at: session.expires_at,
        })
    }

    /// Whether the session row still exists and is unexpired.
    ///
    /// The connection handler calls this once the connection is visible to
    /// the hub: a revoke that deleted the row before then never reached it.
    pub fn is_live(&self, session_id: SessionId) -> Result<bool, AuthError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(session_id)?
            .is_some_and(|session| !session.is_expired_at(now)))
    }

    // -----------------------------------------------------------------------
    // Revoke
    // -----------------------------------------------------------------------

    /// Deletes one session row and tells the listener.
    ///
    /// Returns whether a row existed. The listener is notified either way,
    /// so connections registered under a row that was already swept are
    /// still closed.
    pub async fn revoke_session(
        &self,
        session_id: SessionId,
        reason: RevocationReason,
    ) -> Result<bool, AuthError> {
        let removed = self.store.remove(session_id)?;

        let mut event = AuditEvent::new(AuditAction::SessionRevoked, self.clock.now())
            .session(session_id)
            .detail(reason.as_str());
        if let Some(row) = &removed {
            event = event.user(row.user_id, row.username.clone());
        }
        self.audit.record(event);
        tracing::info!(%session_id, reason = reason.as_str(), existed = removed.is_some(), "session revoked");

        self.listener
            .on_revoked(Revocation::Session(session_id), reason)
            .await;
        Ok(removed.is_some())
    }

    /// Deletes every session row for `user_id` and tells the listener.
    ///
    /// Password change and account deactivation call this; "logout
    /// everywhere" is not optional for them.
    pub async fn revoke_all_sessions_for_user(
        &self,
        user_id: UserId,
        reason: RevocationReason,
    ) -> Result<usize, AuthError> {
        let removed = self.store.remove_for_user(user_id)?;

        self.audit.record(
            AuditEvent::new(AuditAction::AllSessionsRevoked, self.clock.now())
                .user_id(user_id)
                .detail(format!("{} ({} sessions)", reason.as_str(), removed.len())),
        );
        tracing::info!(%user_id, reason = reason.as_str(), count = removed.len(), "all sessions revoked");

        self.listener
            .on_revoked(Revocation::User(user_id), reason)
            .await;
        Ok(removed.len())
    }

    /// Live (unexpired) sessions of a user, oldest first.
    pub fn sessions_for_user(&self, user_id: UserId) -> Result<Vec<Session>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_for_user(user_id)?
            .into_iter()
            .filter(|s| !s.is_expired_at(now))
            .collect())
    }

    /// Number of stored rows, expired or not.
    pub fn session_count(&self) -> Result<usize, AuthError> {
        self.store.len()
    }

    // -----------------------------------------------------------------------
    // Expiry sweep
    // -----------------------------------------------------------------------

    /// Deletes rows past `expires_at`. Returns how many were removed.
    ///
    /// No hub notification: expired tokens already fail validation, and
    /// live connections close themselves at `expires_at`.
    pub fn sweep_expired(&self) -> Result<usize, AuthError> {
        let now = self.clock.now();
        let purged = self.store.purge_expired(now)?;
        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "expired sessions purged");
            self.audit.record(
                AuditEvent::new(AuditAction::SessionsExpired, now)
                    .detail(format!("{} sessions", purged.len())),
            );
        }
        Ok(purged.len())
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every
    /// `config.sweep_interval` until `cancel` fires.
    pub fn spawn_expiry_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let authority = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = authority.sweep_expired() {
                            tracing::warn!(error = %e, "session sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("session sweep stopped");
        })
    }
}

fn parse_uuid(raw: &str, claim: &str) -> Result<Uuid, AuthError> {
    Uuid::parse_str(raw).map_err(|_| AuthError::Malformed(format!("invalid {claim} claim")))
}
