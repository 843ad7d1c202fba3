use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha224};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{NewToken, Repo, Token, User};

const TOKEN_BYTES: usize = 32;
const HINT_LENGTH: usize = 4;
const TOKEN_LIFETIME_DAYS: i64 = 30;

/// A freshly minted token. The plaintext exists only in this value.
pub struct IssuedToken {
    pub plaintext: String,
    pub token: Token,
}

/// Bearer tokens for git transfers. Only a SHA-224 digest of the raw bytes is
/// persisted.
#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn Store>,
}

impl TokenService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn create(&self, user_id: i64, read_only: bool) -> Result<IssuedToken> {
        let mut raw = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);

        let plaintext = URL_SAFE_NO_PAD.encode(raw);
        let new_token = NewToken {
            user_id,
            hash: hash_token(&raw),
            hint: plaintext.chars().take(HINT_LENGTH).collect(),
            expires_at: expiry_from(Utc::now()),
            read_only,
        };

        let token = self.store.create_token(&new_token)?;
        tracing::info!(user_id, token_id = token.id, read_only, "Token created");
        Ok(IssuedToken { plaintext, token })
    }

    /// Checks a plaintext token presented for `user_name`. The token row is
    /// looked up joined to that user, never from the hash alone.
    pub fn verify(&self, user_name: &str, plaintext: &str, want_write: bool) -> Result<Token> {
        let raw = URL_SAFE_NO_PAD
            .decode(plaintext.trim())
            .map_err(|_| Error::InvalidToken)?;
        if raw.len() != TOKEN_BYTES {
            return Err(Error::InvalidToken);
        }

        let token = self
            .store
            .get_token_for_user(user_name, &hash_token(&raw))?
            .ok_or(Error::InvalidToken)?;

        if token.is_expired(Utc::now()) {
            return Err(Error::TokenExpired);
        }
        if want_write && token.read_only {
            return Err(Error::TokenReadOnly);
        }
        Ok(token)
    }

    pub fn renew(&self, user_id: i64, token_id: i64) -> Result<DateTime<Utc>> {
        let expires_at = expiry_from(Utc::now());
        self.store.set_token_expiry(user_id, token_id, expires_at)?;
        Ok(expires_at)
    }

    pub fn delete(&self, user_id: i64, token_id: i64) -> Result<()> {
        self.store.delete_token(user_id, token_id)
    }

    pub fn list(&self, user_id: i64) -> Result<Vec<Token>> {
        self.store.list_user_tokens(user_id)
    }
}

fn expiry_from(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(TOKEN_LIFETIME_DAYS)
}

#[must_use]
pub fn hash_token(raw: &[u8]) -> String {
    STANDARD.encode(Sha224::digest(raw))
}

/// Password transfers are refused as soon as either side asks for tokens.
#[must_use]
pub fn can_use_password(user: &User, repo: &Repo) -> bool {
    !user.secure_transfer && !repo.secure_transfer
}
