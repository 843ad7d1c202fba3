use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::directory::{BindOutcome, DirectoryBind};
use super::otp::verify_code;
use super::password::PasswordHasher;
use super::token::{TokenService, can_use_password};
use super::{AttemptGuard, SessionCache, SessionState};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Repo, User};
use crate::validation::{validate_password, validate_user_name};

/// Where passwords are checked. Chosen once at startup.
pub enum Backend {
    Local(PasswordHasher),
    Directory(Arc<dyn DirectoryBind>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated(User),
    AwaitOtp(User),
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    backend: Backend,
    guard: Arc<AttemptGuard>,
    sessions: Arc<SessionCache>,
    tokens: TokenService,
    registration: bool,
    /// Fingerprint to user id, for sessions that just re-entered their password.
    confirmed: Mutex<HashMap<String, i64>>,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Backend,
        guard: Arc<AttemptGuard>,
        sessions: Arc<SessionCache>,
        registration: bool,
    ) -> Self {
        let tokens = TokenService::new(store.clone());
        // Accounts live in the directory, so nobody registers locally.
        let registration = registration && matches!(backend, Backend::Local(_));
        Self {
            store,
            backend,
            guard,
            sessions,
            tokens,
            registration,
            confirmed: Mutex::new(HashMap::new()),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[must_use]
    pub fn registration_open(&self) -> bool {
        self.registration
    }

    #[must_use]
    pub fn uses_directory(&self) -> bool {
        matches!(self.backend, Backend::Directory(_))
    }

    pub fn register(&self, name: &str, password: &str, address: IpAddr) -> Result<User> {
        let Backend::Local(hasher) = &self.backend else {
            return Err(Error::RegistrationClosed);
        };
        if !self.registration {
            return Err(Error::RegistrationClosed);
        }
        validate_user_name(name)?;
        validate_password(password)?;
        self.guard.check_registration(address)?;

        let hash = hasher.hash(password)?;
        let user = self.store.create_user(name, Some(&hash))?;
        tracing::info!(user = %user.name, %address, "User registered");
        Ok(user)
    }

    /// Hash for a new local password; directory accounts have none.
    pub fn hash_password(&self, password: &str) -> Result<String> {
        match &self.backend {
            Backend::Local(hasher) => {
                validate_password(password)?;
                hasher.hash(password)
            }
            Backend::Directory(_) => Err(Error::PermissionDenied),
        }
    }

    fn confirmed(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.confirmed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verifies the current password of an already identified user, used
    /// before sensitive account changes. Success is remembered for the
    /// session until [`Self::take_confirmation`] consumes it.
    pub async fn confirm_password(
        &self,
        user: &User,
        password: &str,
        fingerprint: &str,
        address: IpAddr,
    ) -> Result<()> {
        self.check_password(&user.name, password, address).await?;
        self.confirmed().insert(fingerprint.to_string(), user.id);
        Ok(())
    }

    /// True once per successful [`Self::confirm_password`] by the same user.
    pub fn take_confirmation(&self, fingerprint: &str, user: &User) -> bool {
        self.confirmed().remove(fingerprint) == Some(user.id)
    }

    async fn check_password(&self, name: &str, password: &str, address: IpAddr) -> Result<User> {
        if name.is_empty() || password.is_empty() {
            return Err(Error::EmptyField);
        }
        self.guard.check(name, address)?;
        self.verify_password(name, password, address).await
    }

    /// Password check without touching the attempt counters.
    async fn verify_password(&self, name: &str, password: &str, address: IpAddr) -> Result<User> {
        let user = match &self.backend {
            Backend::Local(hasher) => {
                let user = self.store.get_user_by_name(name)?;
                let hash = user.as_ref().and_then(|u| u.password_hash.as_deref());
                match (user.as_ref(), hash) {
                    (Some(user), Some(hash)) if hasher.verify(password, hash)? => user.clone(),
                    _ => return Err(self.rejected(name, address)),
                }
            }
            Backend::Directory(directory) => match directory.bind(name, password).await? {
                BindOutcome::Rejected => return Err(self.rejected(name, address)),
                BindOutcome::Accepted => match self.store.get_user_by_name(name)? {
                    Some(user) => user,
                    None => {
                        let user = self.store.create_user(name, None)?;
                        tracing::info!(user = %user.name, "Provisioned user from directory");
                        user
                    }
                },
            },
        };
        Ok(user)
    }

    fn rejected(&self, name: &str, address: IpAddr) -> Error {
        tracing::warn!(account = name, %address, "Authentication failed");
        Error::InvalidCredential
    }

    /// Hypertext login: binds the certificate to the account. Accounts with a
    /// second factor land in `AwaitOtp`.
    pub async fn login(
        &self,
        name: &str,
        password: &str,
        fingerprint: &str,
        address: IpAddr,
    ) -> Result<LoginOutcome> {
        let user = self.check_password(name, password, address).await?;

        let pending_otp = user.has_otp();
        let session = self.store.create_session(fingerprint, user.id, pending_otp)?;
        self.sessions.put(&session, user.clone());
        tracing::info!(user = %user.name, %address, pending_otp, "Session opened");

        Ok(if pending_otp {
            LoginOutcome::AwaitOtp(user)
        } else {
            LoginOutcome::Authenticated(user)
        })
    }

    /// Second step of a login for accounts with TOTP enrolled.
    pub fn login_otp(&self, fingerprint: &str, code: &str, address: IpAddr) -> Result<User> {
        let SessionState::AwaitOtp(user) = self.sessions.get(fingerprint)? else {
            return Err(Error::NoPendingOtp);
        };
        self.guard.check(&user.name, address)?;

        let secret = user.totp_secret.as_deref().ok_or(Error::OtpNotEnabled)?;
        if !verify_code(secret, &user.name, code)? {
            tracing::warn!(account = %user.name, %address, "Wrong second factor code");
            return Err(Error::WrongCode);
        }

        self.sessions.confirm(fingerprint)?;
        Ok(user)
    }

    /// Credential check for git transfers. The secret is tried as a token
    /// first, then as a password when neither the account nor the repository
    /// is in secure-transfer mode. Every call counts as one attempt. No
    /// session is created.
    ///
    /// A secure-transfer account refuses passwords with the same error as a
    /// wrong password, so the answer does not reveal which accounts exist.
    pub async fn transfer_login(
        &self,
        name: &str,
        secret: &str,
        repo: &Repo,
        want_write: bool,
        address: IpAddr,
    ) -> Result<User> {
        if name.is_empty() || secret.is_empty() {
            return Err(Error::EmptyField);
        }
        self.guard.check(name, address)?;

        match self.tokens.verify(name, secret, want_write) {
            Ok(token) => {
                return self
                    .store
                    .get_user(token.user_id)?
                    .ok_or(Error::InvalidCredential);
            }
            Err(Error::InvalidToken) => {}
            Err(e) => return Err(e),
        }

        if repo.secure_transfer {
            return Err(Error::PasswordNotAllowed);
        }
        if let Some(user) = self.store.get_user_by_name(name)? {
            if !can_use_password(&user, repo) {
                return Err(self.rejected(name, address));
            }
        }

        self.verify_password(name, secret, address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionConfig;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::time::Duration;

    const ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1));

    fn setup(backend: Backend) -> (Arc<SqliteStore>, Arc<SessionCache>, Authenticator) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let sessions = Arc::new(SessionCache::new(store.clone(), Duration::from_secs(3600)));
        let guard = Arc::new(AttemptGuard::new(&ProtectionConfig::default()));
        let auth = Authenticator::new(store.clone(), backend, guard, sessions.clone(), true);
        (store, sessions, auth)
    }

    fn local() -> Backend {
        Backend::Local(PasswordHasher::with_params(8, 1).unwrap())
    }

    struct FakeDirectory;

    #[async_trait]
    impl DirectoryBind for FakeDirectory {
        async fn bind(&self, _name: &str, password: &str) -> Result<BindOutcome> {
            Ok(if password == "directory-pass" {
                BindOutcome::Accepted
            } else {
                BindOutcome::Rejected
            })
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let (_store, sessions, auth) = setup(local());
        auth.register("alice", "hunter2!", ADDR).unwrap();

        assert!(matches!(
            auth.register("Alice", "hunter2!", ADDR),
            Err(Error::NameTaken)
        ));
        assert!(matches!(
            auth.register("bob", "short", ADDR),
            Err(Error::PasswordTooShort)
        ));

        let outcome = auth.login("alice", "hunter2!", "F1", ADDR).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
        assert!(sessions.user("F1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_password_is_not_disambiguated() {
        let (_store, _sessions, auth) = setup(local());
        auth.register("alice", "hunter2!", ADDR).unwrap();

        let wrong = auth.login("alice", "nope!!", "F1", ADDR).await.unwrap_err();
        let missing = auth.login("nobody", "nope!!", "F1", ADDR).await.unwrap_err();
        assert_eq!(wrong.public_message(), missing.public_message());
    }

    #[tokio::test]
    async fn test_relogin_after_disconnect_recreates_session() {
        let (store, sessions, auth) = setup(local());
        auth.register("alice", "hunter2!", ADDR).unwrap();

        auth.login("alice", "hunter2!", "F1", ADDR).await.unwrap();
        sessions.invalidate("F1").unwrap();
        assert!(store.get_session("F1").unwrap().is_none());

        auth.login("alice", "hunter2!", "F1", ADDR).await.unwrap();
        assert!(store.get_session("F1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_otp_login_flow() {
        let (store, sessions, auth) = setup(local());
        let user = auth.register("alice", "hunter2!", ADDR).unwrap();
        let secret = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";
        store.set_totp_secret(user.id, Some(secret)).unwrap();

        let outcome = auth.login("alice", "hunter2!", "F1", ADDR).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::AwaitOtp(_)));
        assert!(sessions.user("F1").unwrap().is_none());

        assert!(matches!(
            auth.login_otp("F1", "000000x", ADDR),
            Err(Error::WrongCode)
        ));
        let code = crate::auth::otp::current_code(secret, "alice").unwrap();
        auth.login_otp("F1", &code, ADDR).unwrap();
        assert!(sessions.user("F1").unwrap().is_some());

        assert!(matches!(
            auth.login_otp("F1", &code, ADDR),
            Err(Error::NoPendingOtp)
        ));
    }

    #[tokio::test]
    async fn test_address_lockout_then_reset() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let sessions = Arc::new(SessionCache::new(store.clone(), Duration::from_secs(3600)));
        let guard = Arc::new(AttemptGuard::new(&ProtectionConfig::default()));
        let auth = Authenticator::new(store.clone(), local(), guard.clone(), sessions, true);
        auth.register("alice", "hunter2!", ADDR).unwrap();
        auth.register("bob", "hunter2!", ADDR).unwrap();

        for _ in 0..10 {
            let _ = auth.login("alice", "wrong!!", "F1", ADDR).await;
        }
        assert!(matches!(
            auth.login("alice", "hunter2!", "F1", ADDR).await,
            Err(Error::TooManyAttempts)
        ));
        assert!(matches!(
            auth.login("bob", "hunter2!", "F2", ADDR).await,
            Err(Error::TooManyAttempts)
        ));

        guard.reset();
        auth.login("alice", "hunter2!", "F1", ADDR).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_login_prefers_token() {
        let (store, _sessions, auth) = setup(local());
        let alice = auth.register("alice", "hunter2!", ADDR).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        store.set_user_secure_transfer(alice.id, true).unwrap();

        let issued = auth.tokens().create(alice.id, true).unwrap();
        let user = auth
            .transfer_login("alice", &issued.plaintext, &repo, false, ADDR)
            .await
            .unwrap();
        assert_eq!(user.id, alice.id);

        assert!(matches!(
            auth.transfer_login("alice", &issued.plaintext, &repo, true, ADDR).await,
            Err(Error::TokenReadOnly)
        ));
        assert!(matches!(
            auth.transfer_login("alice", "hunter2!", &repo, false, ADDR).await,
            Err(Error::InvalidCredential)
        ));

        store.set_user_secure_transfer(alice.id, false).unwrap();
        auth.transfer_login("alice", "hunter2!", &repo, true, ADDR)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_is_single_use() {
        let (_store, _sessions, auth) = setup(local());
        let alice = auth.register("alice", "hunter2!", ADDR).unwrap();

        assert!(matches!(
            auth.confirm_password(&alice, "wrong!!", "F1", ADDR).await,
            Err(Error::InvalidCredential)
        ));
        assert!(!auth.take_confirmation("F1", &alice));

        auth.confirm_password(&alice, "hunter2!", "F1", ADDR)
            .await
            .unwrap();
        assert!(!auth.take_confirmation("F2", &alice));
        assert!(auth.take_confirmation("F1", &alice));
        assert!(!auth.take_confirmation("F1", &alice));
    }

    #[tokio::test]
    async fn test_secure_account_answers_like_unknown_account() {
        let (store, _sessions, auth) = setup(local());
        let alice = auth.register("alice", "hunter2!", ADDR).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        store.set_user_secure_transfer(alice.id, true).unwrap();

        let secure = auth
            .transfer_login("alice", "guess!!", &repo, false, ADDR)
            .await
            .unwrap_err();
        let unknown = auth
            .transfer_login("mallory", "guess!!", &repo, false, ADDR)
            .await
            .unwrap_err();
        assert_eq!(secure.public_message(), unknown.public_message());
    }

    #[tokio::test]
    async fn test_secure_repository_asks_for_a_token() {
        let (store, _sessions, auth) = setup(local());
        let alice = auth.register("alice", "hunter2!", ADDR).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        store.toggle_repo_secure_transfer(alice.id, repo.id).unwrap();
        let repo = store.get_repo_by_id(repo.id).unwrap().unwrap();

        for name in ["alice", "mallory"] {
            assert!(matches!(
                auth.transfer_login(name, "hunter2!", &repo, false, ADDR).await,
                Err(Error::PasswordNotAllowed)
            ));
        }
    }

    #[tokio::test]
    async fn test_token_guesses_count_as_attempts() {
        let (store, _sessions, auth) = setup(local());
        let alice = auth.register("alice", "hunter2!", ADDR).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        store.set_user_secure_transfer(alice.id, true).unwrap();
        let issued = auth.tokens().create(alice.id, false).unwrap();

        for _ in 0..5 {
            let _ = auth
                .transfer_login("alice", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", &repo, false, ADDR)
                .await;
        }
        assert!(matches!(
            auth.transfer_login("alice", &issued.plaintext, &repo, false, ADDR).await,
            Err(Error::AccountLocked)
        ));
    }

    #[tokio::test]
    async fn test_directory_backend_provisions_users() {
        let (store, _sessions, auth) = setup(Backend::Directory(Arc::new(FakeDirectory)));
        assert!(!auth.registration_open());
        assert!(matches!(
            auth.register("alice", "hunter2!", ADDR),
            Err(Error::RegistrationClosed)
        ));

        assert!(matches!(
            auth.login("alice", "wrong", "F1", ADDR).await,
            Err(Error::InvalidCredential)
        ));
        auth.login("alice", "directory-pass", "F1", ADDR).await.unwrap();

        let user = store.get_user_by_name("alice").unwrap().unwrap();
        assert!(user.password_hash.is_none());
    }
}
