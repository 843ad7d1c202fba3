use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::store::Store;
use crate::types::{Session, User};

/// Where a certificate stands in the login flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    AwaitOtp(User),
    Authenticated(User),
}

impl SessionState {
    #[must_use]
    pub fn authenticated(&self) -> Option<&User> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSession {
    user: User,
    created_at: DateTime<Utc>,
    pending_otp: bool,
}

impl CachedSession {
    fn state(&self) -> SessionState {
        if self.pending_otp {
            SessionState::AwaitOtp(self.user.clone())
        } else {
            SessionState::Authenticated(self.user.clone())
        }
    }
}

/// Fingerprint to user snapshot, written through to the `certificate` table.
pub struct SessionCache {
    store: Arc<dyn Store>,
    timeout: Duration,
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn Store>, timeout: std::time::Duration) -> Self {
        Self {
            store,
            timeout: Duration::from_std(timeout).unwrap_or_else(|_| Duration::days(365)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CachedSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves a fingerprint, re-joining the durable row on a cache miss.
    pub fn get(&self, fingerprint: &str) -> Result<SessionState> {
        if let Some(cached) = self.sessions().get(fingerprint) {
            return Ok(cached.state());
        }

        let Some((session, user)) = self.store.get_session(fingerprint)? else {
            return Ok(SessionState::Anonymous);
        };
        let cached = CachedSession {
            user,
            created_at: session.created_at,
            pending_otp: session.pending_otp,
        };
        let state = cached.state();
        self.sessions().insert(session.fingerprint, cached);
        Ok(state)
    }

    /// The user behind a fully authenticated session.
    pub fn user(&self, fingerprint: &str) -> Result<Option<User>> {
        Ok(match self.get(fingerprint)? {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        })
    }

    /// Caches a session whose durable row was just written.
    pub fn put(&self, session: &Session, user: User) {
        self.sessions().insert(
            session.fingerprint.clone(),
            CachedSession {
                user,
                created_at: session.created_at,
                pending_otp: session.pending_otp,
            },
        );
    }

    /// Promotes an `AwaitOtp` session to authenticated.
    pub fn confirm(&self, fingerprint: &str) -> Result<()> {
        self.store.confirm_session(fingerprint)?;
        if let Some(cached) = self.sessions().get_mut(fingerprint) {
            cached.pending_otp = false;
        }
        Ok(())
    }

    pub fn invalidate(&self, fingerprint: &str) -> Result<()> {
        self.sessions().remove(fingerprint);
        self.store.delete_session(fingerprint)?;
        Ok(())
    }

    /// Drops every session of the user except `keep`.
    pub fn invalidate_all_for(&self, user_id: i64, keep: Option<&str>) -> Result<usize> {
        self.sessions()
            .retain(|fp, s| s.user.id != user_id || Some(fp.as_str()) == keep);
        self.store.delete_user_sessions(user_id, keep)
    }

    /// Replaces the snapshot held by every cached session of this user.
    pub fn update_user(&self, user: &User) {
        for cached in self.sessions().values_mut() {
            if cached.user.id == user.id {
                cached.user = user.clone();
            }
        }
    }

    /// Forgets the user's sessions without touching the store, for rows that
    /// were already removed by a cascade.
    pub fn forget_user(&self, user_id: i64) {
        self.sessions().retain(|_, s| s.user.id != user_id);
    }

    /// Removes sessions created before `now - timeout`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.timeout;
        self.sessions().retain(|_, s| s.created_at >= cutoff);
        let removed = self.store.delete_sessions_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, "Expired sessions swept");
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.sessions().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn cache() -> (Arc<SqliteStore>, SessionCache, User) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let user = store.create_user("alice", None).unwrap();
        let cache = SessionCache::new(store.clone(), std::time::Duration::from_secs(3600));
        (store, cache, user)
    }

    #[test]
    fn test_unknown_fingerprint_is_anonymous() {
        let (_store, cache, _user) = cache();
        assert_eq!(cache.get("nobody").unwrap(), SessionState::Anonymous);
        assert_eq!(cache.cached_len(), 0);
    }

    #[test]
    fn test_miss_rejoins_durable_row() {
        let (store, cache, user) = cache();
        store.create_session("F1", user.id, false).unwrap();

        let state = cache.get("F1").unwrap();
        assert_eq!(state.authenticated().map(|u| u.id), Some(user.id));
        assert_eq!(cache.cached_len(), 1);
    }

    #[test]
    fn test_pending_otp_then_confirm() {
        let (store, cache, user) = cache();
        let session = store.create_session("F1", user.id, true).unwrap();
        cache.put(&session, user.clone());

        assert!(matches!(cache.get("F1").unwrap(), SessionState::AwaitOtp(_)));
        assert!(cache.user("F1").unwrap().is_none());

        cache.confirm("F1").unwrap();
        assert!(cache.user("F1").unwrap().is_some());
        assert!(!store.get_session("F1").unwrap().unwrap().0.pending_otp);
    }

    #[test]
    fn test_invalidate_removes_both_layers() {
        let (store, cache, user) = cache();
        let session = store.create_session("F1", user.id, false).unwrap();
        cache.put(&session, user);

        cache.invalidate("F1").unwrap();
        assert_eq!(cache.get("F1").unwrap(), SessionState::Anonymous);
        assert!(store.get_session("F1").unwrap().is_none());
    }

    #[test]
    fn test_invalidate_all_keeps_current() {
        let (store, cache, user) = cache();
        for fp in ["F1", "F2", "F3"] {
            let session = store.create_session(fp, user.id, false).unwrap();
            cache.put(&session, user.clone());
        }

        assert_eq!(cache.invalidate_all_for(user.id, Some("F2")).unwrap(), 2);
        assert!(cache.user("F2").unwrap().is_some());
        assert!(cache.user("F1").unwrap().is_none());
        assert!(cache.user("F3").unwrap().is_none());
    }

    #[test]
    fn test_sweep_drops_old_sessions() {
        let (store, cache, user) = cache();
        let session = store.create_session("F1", user.id, false).unwrap();
        cache.put(&session, user);

        assert_eq!(cache.sweep(Utc::now()).unwrap(), 0);
        assert_eq!(
            cache.sweep(Utc::now() + Duration::hours(2)).unwrap(),
            1
        );
        assert_eq!(cache.cached_len(), 0);
    }

    #[test]
    fn test_update_user_refreshes_snapshot() {
        let (store, cache, mut user) = cache();
        let session = store.create_session("F1", user.id, false).unwrap();
        cache.put(&session, user.clone());

        user.description = "hello".to_string();
        cache.update_user(&user);
        assert_eq!(cache.user("F1").unwrap().unwrap().description, "hello");
    }
}
