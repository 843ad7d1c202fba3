use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::config::UsersConfig;
use crate::error::{Error, Result};

const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

/// Argon2id hasher for account passwords, stored in PHC string format.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new(config: &UsersConfig) -> Result<Self> {
        Self::with_params(config.password_memory_kib, config.password_iterations)
    }

    /// Builds a hasher with explicit cost. Tests use a tiny memory cost.
    pub fn with_params(memory_kib: u32, iterations: u32) -> Result<Self> {
        let params = Params::new(
            memory_kib,
            iterations,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|e| Error::Config(format!("invalid argon2 params: {e}")))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Hashing(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Verifies a password against a stored hash. Parameters embedded in the
    /// hash win over the hasher's own, so cost changes keep old hashes valid.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| Error::Hashing(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Hashing(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::with_params(8, 1).unwrap()
    }

    #[test]
    fn test_hash_is_phc_format() {
        let hash = hasher().hash("hunter2!").unwrap();
        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn test_verify() {
        let hasher = hasher();
        let hash = hasher.hash("hunter2!").unwrap();
        assert!(hasher.verify("hunter2!", &hash).unwrap());
        assert!(!hasher.verify("hunter3!", &hash).unwrap());
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(matches!(
            hasher().verify("pw", "not-a-hash"),
            Err(Error::Hashing(_))
        ));
    }
}
