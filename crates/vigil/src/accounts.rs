//! User accounts: credential checks and the flows that must revoke
//! sessions.
//!
//! Password change and account deactivation both end with
//! `revoke_all_sessions_for_user`, which in turn closes the user's live
//! realtime connections through the hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use serde::Serialize;
use vigil_protocol::UserId;
use vigil_session::{
    AuditAction, AuditEvent, AuthError, ClientInfo, IssuedSession, Principal, RevocationListener,
    RevocationReason, SessionAuthority, SessionStore, UserIdentity,
};

/// Shortest password `create_user` and `change_password` accept.
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("user {0} not found")]
    UnknownUser(String),

    #[error("username {0} is already taken")]
    UsernameTaken(String),

    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("user directory error: {0}")]
    Directory(String),
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// A stored account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    /// PHC-format argon2 hash.
    pub password_hash: String,
    pub active: bool,
    pub is_admin: bool,
}

/// The public view of an account, as returned by the REST surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
}

impl From<&UserRecord> for UserProfile {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            is_admin: user.is_admin,
        }
    }
}

/// Storage for accounts. Synchronous, like the session store.
pub trait UserDirectory: Send + Sync + 'static {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AccountError>;

    fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, AccountError>;

    /// Fails with [`AccountError::UsernameTaken`] on a duplicate name.
    fn insert(&self, user: UserRecord) -> Result<(), AccountError>;

    fn update_password(&self, id: UserId, password_hash: String) -> Result<(), AccountError>;

    fn set_active(&self, id: UserId, active: bool) -> Result<(), AccountError>;
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<UserId, UserRecord>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<UserId, UserRecord>>, AccountError> {
        self.users
            .lock()
            .map_err(|_| AccountError::Directory("user map lock poisoned".into()))
    }

    fn update(
        &self,
        id: UserId,
        apply: impl FnOnce(&mut UserRecord),
    ) -> Result<(), AccountError> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| AccountError::UnknownUser(id.to_string()))?;
        apply(user);
        Ok(())
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AccountError> {
        Ok(self
            .lock()?
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, AccountError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    fn insert(&self, user: UserRecord) -> Result<(), AccountError> {
        let mut users = self.lock()?;
        if users.values().any(|u| u.username == user.username) {
            return Err(AccountError::UsernameTaken(user.username));
        }
        users.insert(user.id, user);
        Ok(())
    }

    fn update_password(&self, id: UserId, password_hash: String) -> Result<(), AccountError> {
        self.update(id, |user| user.password_hash = password_hash)
    }

    fn set_active(&self, id: UserId, active: bool) -> Result<(), AccountError> {
        self.update(id, |user| user.active = active)
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Argon2id hashing with configurable cost.
///
/// Verification reads the cost from the stored hash, so hashes made with
/// different settings keep verifying.
#[derive(Clone, Default)]
pub struct PasswordHashing {
    argon2: Argon2<'static>,
}

impl PasswordHashing {
    /// Argon2id with `memory_kib` of memory and `iterations` passes.
    pub fn with_cost(memory_kib: u32, iterations: u32) -> Result<Self, AccountError> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| AccountError::Hashing(e.to_string()))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String, AccountError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AccountError::Hashing(e.to_string()))
    }

    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AccountError> {
        let parsed = PasswordHash::new(hash).map_err(|e| AccountError::Hashing(e.to_string()))?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AccountError::Hashing(e.to_string())),
        }
    }

    /// Runs [`verify`](Self::verify) on the blocking pool; argon2 is
    /// deliberately slow.
    async fn verify_blocking(&self, password: &str, hash: &str) -> Result<bool, AccountError> {
        let hashing = self.clone();
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || hashing.verify(&password, &hash))
            .await
            .map_err(|e| AccountError::Hashing(e.to_string()))?
    }

    async fn hash_blocking(&self, password: &str) -> Result<String, AccountError> {
        let hashing = self.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hashing.hash(&password))
            .await
            .map_err(|e| AccountError::Hashing(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// AccountService
// ---------------------------------------------------------------------------

/// A successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: IssuedSession,
    pub user: UserProfile,
}

/// Login, logout, password change, and (de)activation on top of a
/// [`UserDirectory`] and the [`SessionAuthority`].
pub struct AccountService<D, S, L> {
    directory: D,
    authority: Arc<SessionAuthority<S, L>>,
    hashing: PasswordHashing,
}

impl<D, S, L> AccountService<D, S, L>
where
    D: UserDirectory,
    S: SessionStore,
    L: RevocationListener,
{
    pub fn new(directory: D, authority: Arc<SessionAuthority<S, L>>) -> Self {
        Self {
            directory,
            authority,
            hashing: PasswordHashing::default(),
        }
    }

    pub fn with_hashing(mut self, hashing: PasswordHashing) -> Self {
        self.hashing = hashing;
        self
    }

    pub fn authority(&self) -> &Arc<SessionAuthority<S, L>> {
        &self.authority
    }

    /// Adds an account.
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<UserProfile, AccountError> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccountError::WeakPassword);
        }
        let user = UserRecord {
            id: UserId::new(),
            username: username.to_string(),
            password_hash: self.hashing.hash_blocking(password).await?,
            active: true,
            is_admin,
        };
        let profile = UserProfile::from(&user);
        self.directory.insert(user)?;
        tracing::info!(user_id = %profile.id, username, is_admin, "user created");
        Ok(profile)
    }

    /// Checks credentials and issues a session.
    ///
    /// An unknown user and a wrong password are the same
    /// [`AuthError::InvalidCredentials`] to the caller; the audit trail
    /// records which it was.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        client: ClientInfo,
    ) -> Result<LoginOutcome, AccountError> {
        let Some(user) = self.directory.find_by_username(username)? else {
            self.login_failed(username, "unknown user");
            return Err(AuthError::InvalidCredentials.into());
        };
        if !self
            .hashing
            .verify_blocking(password, &user.password_hash)
            .await?
        {
            self.login_failed(username, "wrong password");
            return Err(AuthError::InvalidCredentials.into());
        }
        // The record may have changed while the hash was being checked.
        let user = self.recheck(username, &user)?;

        let identity = UserIdentity {
            user_id: user.id,
            username: user.username.clone(),
        };
        let session = self.authority.issue_session(&identity, client)?;

        // A disable or password change that read the session table before
        // this row existed has to be caught here.
        if let Err(e) = self.recheck(username, &user) {
            let reason = match e {
                AccountError::Auth(AuthError::AccountDisabled) => RevocationReason::AccountDisabled,
                _ => RevocationReason::PasswordChanged,
            };
            self.authority
                .revoke_session(session.session_id, reason)
                .await?;
            return Err(e);
        }

        Ok(LoginOutcome {
            session,
            user: UserProfile::from(&user),
        })
    }

    /// Re-reads `verified` and fails unless it is still active with the
    /// same password hash.
    fn recheck(&self, username: &str, verified: &UserRecord) -> Result<UserRecord, AccountError> {
        let current = self.directory.find_by_id(verified.id)?;
        match current {
            Some(user) if user.password_hash != verified.password_hash => {
                self.login_failed(username, "password changed during login");
                Err(AuthError::InvalidCredentials.into())
            }
            Some(user) if user.active => Ok(user),
            Some(_) => {
                self.login_failed(username, "account disabled");
                Err(AuthError::AccountDisabled.into())
            }
            None => {
                self.login_failed(username, "unknown user");
                Err(AuthError::InvalidCredentials.into())
            }
        }
    }

    /// Revokes the caller's own session.
    pub async fn logout(&self, principal: &Principal) -> Result<bool, AccountError> {
        Ok(self
            .authority
            .revoke_session(principal.session_id, RevocationReason::Logout)
            .await?)
    }

    /// Replaces the password and logs the user out everywhere. Returns
    /// how many sessions were revoked.
    pub async fn change_password(
        &self,
        user_id: UserId,
        current: &str,
        new: &str,
    ) -> Result<usize, AccountError> {
        let user = self
            .directory
            .find_by_id(user_id)?
            .ok_or_else(|| AccountError::UnknownUser(user_id.to_string()))?;
        if !self
            .hashing
            .verify_blocking(current, &user.password_hash)
            .await?
        {
            return Err(AuthError::InvalidCredentials.into());
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccountError::WeakPassword);
        }

        let hash = self.hashing.hash_blocking(new).await?;
        self.directory.update_password(user_id, hash)?;
        tracing::info!(%user_id, "password changed");

        Ok(self
            .authority
            .revoke_all_sessions_for_user(user_id, RevocationReason::PasswordChanged)
            .await?)
    }

    /// Enables or disables an account. Disabling revokes every session;
    /// returns how many.
    pub async fn set_active(&self, username: &str, active: bool) -> Result<usize, AccountError> {
        let user = self
            .directory
            .find_by_username(username)?
            .ok_or_else(|| AccountError::UnknownUser(username.to_string()))?;
        self.directory.set_active(user.id, active)?;
        tracing::info!(user_id = %user.id, username, active, "account status changed");

        if active {
            return Ok(0);
        }
        Ok(self
            .authority
            .revoke_all_sessions_for_user(user.id, RevocationReason::AccountDisabled)
            .await?)
    }

    pub fn profile(&self, user_id: UserId) -> Result<UserProfile, AccountError> {
        self.directory
            .find_by_id(user_id)?
            .map(|u| UserProfile::from(&u))
            .ok_or_else(|| AccountError::UnknownUser(user_id.to_string()))
    }

    fn login_failed(&self, username: &str, detail: &str) {
        tracing::info!(username, detail, "login failed");
        self.authority.audit().record(
            AuditEvent::new(AuditAction::LoginFailed, self.authority.now())
                .username(username)
                .detail(detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use vigil_session::{NoopListener, SessionConfig};

    use super::*;

    type Service = AccountService<MemoryUserDirectory, vigil_session::MemorySessionStore, NoopListener>;

    fn service() -> Service {
        let authority = Arc::new(SessionAuthority::new(
            b"accounts-test-secret",
            SessionConfig::default(),
        ));
        AccountService::new(MemoryUserDirectory::new(), authority)
            .with_hashing(PasswordHashing::with_cost(8, 1).unwrap())
    }

    #[test]
    fn test_password_hashing_verify_matches_only_original() {
        let hashing = PasswordHashing::with_cost(8, 1).unwrap();
        let hash = hashing.hash("correct horse").unwrap();
        assert!(hashing.verify("correct horse", &hash).unwrap());
        assert!(!hashing.verify("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_password_hashing_verify_garbage_hash_is_error() {
        let hashing = PasswordHashing::default();
        assert!(matches!(
            hashing.verify("pw", "not-a-phc-string"),
            Err(AccountError::Hashing(_))
        ));
    }

    #[tokio::test]
    async fn test_create_user_duplicate_name_is_rejected() {
        let svc = service();
        svc.create_user("alice", "password1", false).await.unwrap();
        let err = svc.create_user("alice", "password2", false).await.unwrap_err();
        assert!(matches!(err, AccountError::UsernameTaken(_)));
    }

    #[tokio::test]
    async fn test_create_user_short_password_is_rejected() {
        let err = service().create_user("bob", "short", false).await.unwrap_err();
        assert!(matches!(err, AccountError::WeakPassword));
    }

    #[tokio::test]
    async fn test_login_issues_valid_token() {
        let svc = service();
        let profile = svc.create_user("alice", "password1", true).await.unwrap();

        let outcome = svc
            .login("alice", "password1", ClientInfo::default())
            .await
            .unwrap();
        assert_eq!(outcome.user, profile);

        let principal = svc.authority().validate_token(&outcome.session.token).unwrap();
        assert_eq!(principal.user_id, profile.id);
        assert_eq!(principal.session_id, outcome.session.session_id);
    }

    #[tokio::test]
    async fn test_login_wrong_password_and_unknown_user_look_the_same() {
        let svc = service();
        svc.create_user("alice", "password1", false).await.unwrap();

        let wrong = svc.login("alice", "nope-nope", ClientInfo::default()).await;
        let unknown = svc.login("mallory", "password1", ClientInfo::default()).await;
        assert!(matches!(
            wrong,
            Err(AccountError::Auth(AuthError::InvalidCredentials))
        ));
        assert!(matches!(
            unknown,
            Err(AccountError::Auth(AuthError::InvalidCredentials))
        ));
    }

    #[tokio::test]
    async fn test_logout_revokes_only_that_session() {
        let svc = service();
        svc.create_user("alice", "password1", false).await.unwrap();
        let first = svc.login("alice", "password1", ClientInfo::default()).await.unwrap();
        let second = svc.login("alice", "password1", ClientInfo::default()).await.unwrap();

        let principal = svc.authority().validate_token(&first.session.token).unwrap();
        assert!(svc.logout(&principal).await.unwrap());

        assert!(matches!(
            svc.authority().validate_token(&first.session.token),
            Err(AuthError::Revoked)
        ));
        assert!(svc.authority().validate_token(&second.session.token).is_ok());
    }

    #[tokio::test]
    async fn test_change_password_revokes_every_session() {
        let svc = service();
        let profile = svc.create_user("alice", "password1", false).await.unwrap();
        let a = svc.login("alice", "password1", ClientInfo::default()).await.unwrap();
        let b = svc.login("alice", "password1", ClientInfo::default()).await.unwrap();

        let revoked = svc
            .change_password(profile.id, "password1", "password2")
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        for token in [&a.session.token, &b.session.token] {
            assert!(matches!(
                svc.authority().validate_token(token),
                Err(AuthError::Revoked)
            ));
        }

        assert!(svc.login("alice", "password1", ClientInfo::default()).await.is_err());
        assert!(svc.login("alice", "password2", ClientInfo::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password_wrong_current_keeps_sessions() {
        let svc = service();
        let profile = svc.create_user("alice", "password1", false).await.unwrap();
        let a = svc.login("alice", "password1", ClientInfo::default()).await.unwrap();

        let err = svc
            .change_password(profile.id, "not-it-at-all", "password2")
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Auth(AuthError::InvalidCredentials)));
        assert!(svc.authority().validate_token(&a.session.token).is_ok());
    }

    #[tokio::test]
    async fn test_set_active_false_revokes_and_blocks_login() {
        let svc = service();
        svc.create_user("alice", "password1", false).await.unwrap();
        let a = svc.login("alice", "password1", ClientInfo::default()).await.unwrap();

        assert_eq!(svc.set_active("alice", false).await.unwrap(), 1);
        assert!(svc.authority().validate_token(&a.session.token).is_err());

        let err = svc
            .login("alice", "password1", ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Auth(AuthError::AccountDisabled)));

        assert_eq!(svc.set_active("alice", true).await.unwrap(), 0);
        assert!(svc.login("alice", "password1", ClientInfo::default()).await.is_ok());
    }

    /// Directory that applies `change` to the stored record right after
    /// its `after_read`-th lookup, standing in for an admin acting while a
    /// login is in flight.
    struct ChangingDirectory {
        inner: MemoryUserDirectory,
        reads: AtomicUsize,
        after_read: usize,
        change: fn(&mut UserRecord),
    }

    impl ChangingDirectory {
        fn new(after_read: usize, change: fn(&mut UserRecord)) -> Self {
            Self {
                inner: MemoryUserDirectory::new(),
                reads: AtomicUsize::new(0),
                after_read,
                change,
            }
        }

        fn counted(&self, found: Option<UserRecord>) -> Result<Option<UserRecord>, AccountError> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            match &found {
                Some(user) if read == self.after_read => self.inner.update(user.id, self.change)?,
                _ => {}
            }
            Ok(found)
        }
    }

    impl UserDirectory for ChangingDirectory {
        fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AccountError> {
            let found = self.inner.find_by_username(username)?;
            self.counted(found)
        }

        fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, AccountError> {
            let found = self.inner.find_by_id(id)?;
            self.counted(found)
        }

        fn insert(&self, user: UserRecord) -> Result<(), AccountError> {
            self.inner.insert(user)
        }

        fn update_password(&self, id: UserId, password_hash: String) -> Result<(), AccountError> {
            self.inner.update_password(id, password_hash)
        }

        fn set_active(&self, id: UserId, active: bool) -> Result<(), AccountError> {
            self.inner.set_active(id, active)
        }
    }

    fn changing_service(
        after_read: usize,
        change: fn(&mut UserRecord),
    ) -> AccountService<ChangingDirectory, vigil_session::MemorySessionStore, NoopListener> {
        let authority = Arc::new(SessionAuthority::new(
            b"accounts-test-secret",
            SessionConfig::default(),
        ));
        AccountService::new(ChangingDirectory::new(after_read, change), authority)
            .with_hashing(PasswordHashing::with_cost(8, 1).unwrap())
    }

    #[tokio::test]
    async fn test_login_disabled_during_hash_check_is_refused() {
        // Disabled right after the lookup by name, before the re-read.
        let svc = changing_service(1, |user| user.active = false);
        let profile = svc.create_user("alice", "password1", false).await.unwrap();

        let err = svc
            .login("alice", "password1", ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Auth(AuthError::AccountDisabled)));
        assert!(svc.authority().sessions_for_user(profile.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_login_password_changed_during_hash_check_is_refused() {
        let svc = changing_service(1, |user| user.password_hash = "replaced".into());
        let profile = svc.create_user("alice", "password1", false).await.unwrap();

        let err = svc
            .login("alice", "password1", ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Auth(AuthError::InvalidCredentials)));
        assert!(svc.authority().sessions_for_user(profile.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_login_disabled_while_issuing_revokes_new_session() {
        // Disabled after the first re-read, so the session row gets written.
        let svc = changing_service(2, |user| user.active = false);
        let profile = svc.create_user("alice", "password1", false).await.unwrap();

        let err = svc
            .login("alice", "password1", ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Auth(AuthError::AccountDisabled)));
        assert!(svc.authority().sessions_for_user(profile.id).unwrap().is_empty());
        assert_eq!(svc.authority().session_count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_login_concurrent_with_disable_leaves_no_live_session() {
        let svc = Arc::new(service());
        for round in 0..20 {
            let name = format!("user{round}");
            let profile = svc.create_user(&name, "password1", false).await.unwrap();

            let login = tokio::spawn({
                let svc = Arc::clone(&svc);
                let name = name.clone();
                async move { svc.login(&name, "password1", ClientInfo::default()).await }
            });
            svc.set_active(&name, false).await.unwrap();

            if let Ok(outcome) = login.await.unwrap() {
                assert!(svc.authority().validate_token(&outcome.session.token).is_err());
            }
            assert!(svc.authority().sessions_for_user(profile.id).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_set_active_unknown_user_is_error() {
        let err = service().set_active("ghost", false).await.unwrap_err();
        assert!(matches!(err, AccountError::UnknownUser(_)));
    }
}
