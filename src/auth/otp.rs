use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::{Error, Result};
use crate::types::User;

const ISSUER: &str = "gemforge";
const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP: u64 = 30;

/// A secret handed to the user, awaiting its first valid code.
#[derive(Debug, Clone)]
pub struct Enrolment {
    pub secret: String,
    pub url: String,
}

fn totp(secret: &str, account: &str) -> Result<TOTP> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|e| Error::Config(format!("invalid totp secret: {e:?}")))?;

    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP,
        bytes,
        Some(ISSUER.to_string()),
        account.to_string(),
    )
    .map_err(|e| Error::Config(format!("totp init error: {e}")))
}

/// RFC 6238 check with a 30 second step and one step of drift either way.
pub fn verify_code(secret: &str, account: &str, code: &str) -> Result<bool> {
    let code = code.trim();
    if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    let totp = totp(secret, account)?;
    Ok(totp.check_current(code).unwrap_or(false))
}

/// Current code for a secret; used by the CLI and tests.
pub fn current_code(secret: &str, account: &str) -> Result<String> {
    totp(secret, account)?
        .generate_current()
        .map_err(|e| Error::Config(format!("system clock error: {e}")))
}

/// Enrolments in progress, keyed by certificate fingerprint. Process local;
/// losing one only means the user starts over.
#[derive(Default)]
pub struct OtpEnrolments {
    pending: Mutex<HashMap<String, String>>,
}

impl OtpEnrolments {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts (or restarts) an enrolment for the session.
    pub fn begin(&self, fingerprint: &str, user: &User) -> Result<Enrolment> {
        if user.has_otp() {
            return Err(Error::OtpAlreadyEnabled);
        }

        let secret = match Secret::generate_secret().to_encoded() {
            Secret::Encoded(s) => s,
            Secret::Raw(_) => return Err(Error::Config("totp secret encoding failed".into())),
        };
        let url = totp(&secret, &user.name)?.get_url();

        self.pending()
            .insert(fingerprint.to_string(), secret.clone());
        Ok(Enrolment { secret, url })
    }

    /// The secret currently offered to this session, if any.
    pub fn current(&self, fingerprint: &str) -> Option<String> {
        self.pending().get(fingerprint).cloned()
    }

    /// Checks the first code. On success the enrolment is consumed and the
    /// secret returned so the caller can persist it.
    pub fn confirm(&self, fingerprint: &str, user: &User, code: &str) -> Result<String> {
        let secret = self.current(fingerprint).ok_or(Error::NoPendingOtp)?;
        if !verify_code(&secret, &user.name, code)? {
            return Err(Error::WrongCode);
        }
        self.pending().remove(fingerprint);
        Ok(secret)
    }

    pub fn cancel(&self, fingerprint: &str) {
        self.pending().remove(fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user() -> User {
        User {
            id: 1,
            name: "alice".to_string(),
            password_hash: None,
            description: String::new(),
            created_at: Utc::now(),
            totp_secret: None,
            secure_transfer: false,
        }
    }

    #[test]
    fn test_enrol_and_confirm() {
        let enrolments = OtpEnrolments::new();
        let user = user();
        let enrolment = enrolments.begin("F1", &user).unwrap();
        assert!(enrolment.url.starts_with("otpauth://totp/"));

        assert!(matches!(
            enrolments.confirm("F1", &user, "000000x"),
            Err(Error::WrongCode)
        ));

        let code = current_code(&enrolment.secret, &user.name).unwrap();
        let secret = enrolments.confirm("F1", &user, &code).unwrap();
        assert_eq!(secret, enrolment.secret);
        assert!(enrolments.current("F1").is_none());
    }

    #[test]
    fn test_confirm_without_enrolment() {
        let enrolments = OtpEnrolments::new();
        assert!(matches!(
            enrolments.confirm("F1", &user(), "123456"),
            Err(Error::NoPendingOtp)
        ));
    }

    #[test]
    fn test_already_enrolled() {
        let mut user = user();
        user.totp_secret = Some("JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP".to_string());
        assert!(matches!(
            OtpEnrolments::new().begin("F1", &user),
            Err(Error::OtpAlreadyEnabled)
        ));
    }

    #[test]
    fn test_verify_code_rejects_malformed() {
        let secret = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";
        assert!(!verify_code(secret, "alice", "12345").unwrap());
        assert!(!verify_code(secret, "alice", "abcdef").unwrap());
        let code = current_code(secret, "alice").unwrap();
        assert!(verify_code(secret, "alice", &code).unwrap());
    }
}
