use std::sync::Arc;

use crate::auth::{
    AttemptGuard, Authenticator, Backend, CsrfGuard, LdapDirectory, OtpEnrolments, PasswordHasher,
    SessionCache,
};
use crate::config::Config;
use crate::error::Result;
use crate::git::RepoStorage;
use crate::identity::IdentityService;
use crate::store::{SqliteStore, Store};

/// Everything a request handler on any of the three listeners needs.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub storage: RepoStorage,
    pub guard: Arc<AttemptGuard>,
    pub sessions: Arc<SessionCache>,
    pub csrf: CsrfGuard,
    pub otp: OtpEnrolments,
    pub auth: Authenticator,
    pub identity: IdentityService,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>, backend: Backend) -> Self {
        let storage = RepoStorage::new(config.git.root.clone());
        let guard = Arc::new(AttemptGuard::new(&config.protection));
        let sessions = Arc::new(SessionCache::new(
            store.clone(),
            config.protection.reset_interval(),
        ));
        let auth = Authenticator::new(
            store.clone(),
            backend,
            guard.clone(),
            sessions.clone(),
            config.users.registration,
        );
        let identity = IdentityService::new(store.clone(), sessions.clone(), storage.clone());

        Self {
            csrf: CsrfGuard::new(sessions.clone()),
            otp: OtpEnrolments::new(),
            config,
            store,
            storage,
            guard,
            sessions,
            auth,
            identity,
        }
    }

    /// Opens the configured database and picks the password backend.
    pub fn open(config: Config) -> Result<Self> {
        let store = SqliteStore::new(&config.database.url)?;
        store.initialize()?;

        let backend = if config.ldap.enabled {
            Backend::Directory(Arc::new(LdapDirectory::new(&config.ldap)))
        } else {
            Backend::Local(PasswordHasher::new(&config.users)?)
        };

        Ok(Self::new(config, Arc::new(store), backend))
    }
}
