//! Persistence seam for session rows.
//!
//! Every method is synchronous and expected to finish quickly: the
//! realtime gate calls `get` from inside the WebSocket handshake.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use vigil_protocol::{SessionId, UserId};

use crate::{AuthError, Session};

/// Storage for [`Session`] rows. Owned exclusively by the
/// [`SessionAuthority`](crate::SessionAuthority).
pub trait SessionStore: Send + Sync + 'static {
    fn insert(&self, session: Session) -> Result<(), AuthError>;

    fn get(&self, id: SessionId) -> Result<Option<Session>, AuthError>;

    /// Deletes one row, returning it if it existed.
    fn remove(&self, id: SessionId) -> Result<Option<Session>, AuthError>;

    /// Deletes every row for `user_id`, returning what was removed.
    fn remove_for_user(&self, user_id: UserId) -> Result<Vec<Session>, AuthError>;

    fn list_for_user(&self, user_id: UserId) -> Result<Vec<Session>, AuthError>;

    /// Deletes every row whose `expires_at` is at or before `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>, AuthError>;

    fn len(&self) -> Result<usize, AuthError>;
}

/// In-memory [`SessionStore`]. Rows don't survive a restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SessionId, Session>>, AuthError> {
        self.sessions
            .lock()
            .map_err(|_| AuthError::Store("session map lock poisoned".into()))
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Session) -> Result<(), AuthError> {
        self.lock()?.insert(session.id, session);
        Ok(())
    }

    fn get(&self, id: SessionId) -> Result<Option<Session>, AuthError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    fn remove(&self, id: SessionId) -> Result<Option<Session>, AuthError> {
        Ok(self.lock()?.remove(&id))
    }

    fn remove_for_user(&self, user_id: UserId) -> Result<Vec<Session>, AuthError> {
        let mut sessions = self.lock()?;
        let ids: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id)
            .collect();
        Ok(ids.iter().filter_map(|id| sessions.remove(id)).collect())
    }

    fn list_for_user(&self, user_id: UserId) -> Result<Vec<Session>, AuthError> {
        let mut rows: Vec<Session> = self
            .lock()?
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.issued_at);
        Ok(rows)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>, AuthError> {
        let mut sessions = self.lock()?;
        let ids: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id)
            .collect();
        Ok(ids.iter().filter_map(|id| sessions.remove(id)).collect())
    }

    fn len(&self) -> Result<usize, AuthError> {
        Ok(self.lock()?.len())
    }
}
