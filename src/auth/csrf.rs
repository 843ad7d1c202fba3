use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use rand::rngs::OsRng;

use super::SessionCache;
use crate::error::Result;

const TOKEN_LENGTH: usize = 16;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Path tokens gating mutating account routes. A token is only honoured while
/// the session that requested it is authenticated.
pub struct CsrfGuard {
    sessions: Arc<SessionCache>,
    tokens: Mutex<HashMap<String, String>>,
}

impl CsrfGuard {
    pub fn new(sessions: Arc<SessionCache>) -> Self {
        Self {
            sessions,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issues a fresh token, replacing the previous one. `None` unless the
    /// fingerprint belongs to an authenticated session.
    pub fn issue(&self, fingerprint: &str) -> Result<Option<String>> {
        if self.sessions.user(fingerprint)?.is_none() {
            return Ok(None);
        }
        let token = generate_token();
        self.tokens()
            .insert(fingerprint.to_string(), token.clone());
        Ok(Some(token))
    }

    pub fn verify(&self, fingerprint: &str, token: &str) -> Result<bool> {
        let matches = self
            .tokens()
            .get(fingerprint)
            .is_some_and(|t| t == token);
        if !matches {
            return Ok(false);
        }
        Ok(self.sessions.user(fingerprint)?.is_some())
    }
}

fn generate_token() -> String {
    let mut rng = OsRng;
    (0..TOKEN_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, Store};

    fn setup() -> (Arc<SqliteStore>, Arc<SessionCache>, CsrfGuard) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let sessions = Arc::new(SessionCache::new(
            store.clone(),
            std::time::Duration::from_secs(3600),
        ));
        let guard = CsrfGuard::new(sessions.clone());
        (store, sessions, guard)
    }

    #[test]
    fn test_token_shape() {
        for _ in 0..32 {
            let token = generate_token();
            assert_eq!(token.len(), 16);
            assert!(token.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_only_authenticated_sessions_get_tokens() {
        let (store, _sessions, guard) = setup();
        assert_eq!(guard.issue("F1").unwrap(), None);

        let user = store.create_user("alice", None).unwrap();
        store.create_session("F2", user.id, true).unwrap();
        assert_eq!(guard.issue("F2").unwrap(), None);

        store.create_session("F1", user.id, false).unwrap();
        assert!(guard.issue("F1").unwrap().is_some());
    }

    #[test]
    fn test_token_dies_with_session() {
        let (store, sessions, guard) = setup();
        let user = store.create_user("alice", None).unwrap();
        store.create_session("F1", user.id, false).unwrap();

        let token = guard.issue("F1").unwrap().unwrap();
        assert!(guard.verify("F1", &token).unwrap());
        assert!(!guard.verify("F2", &token).unwrap());

        let newer = guard.issue("F1").unwrap().unwrap();
        if newer != token {
            assert!(!guard.verify("F1", &token).unwrap());
        }

        sessions.invalidate("F1").unwrap();
        assert!(!guard.verify("F1", &newer).unwrap());
    }
}
