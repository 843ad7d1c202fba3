use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use crate::config::ProtectionConfig;
use crate::error::{Error, Result};

#[derive(Default)]
struct Counters {
    accounts: HashMap<String, u32>,
    addresses: HashMap<IpAddr, u32>,
    registrations: HashMap<IpAddr, u32>,
}

/// Per-account and per-address attempt counters, cleared wholesale on every
/// reset tick.
pub struct AttemptGuard {
    ip_limit: u32,
    account_limit: u32,
    registration_limit: u32,
    counters: Mutex<Counters>,
}

impl AttemptGuard {
    pub fn new(config: &ProtectionConfig) -> Self {
        Self {
            ip_limit: config.ip,
            account_limit: config.account,
            registration_limit: config.registration,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a login attempt for `name` from `address`. Both counters are
    /// incremented before either limit is evaluated.
    pub fn check(&self, name: &str, address: IpAddr) -> Result<()> {
        let mut counters = self.counters();

        let by_address = counters.addresses.entry(address).or_default();
        *by_address += 1;
        let by_address = *by_address;

        let by_account = counters.accounts.entry(name.to_lowercase()).or_default();
        *by_account += 1;
        let by_account = *by_account;

        if by_address > self.ip_limit {
            tracing::warn!(%address, "Too many connection attempts");
            return Err(Error::TooManyAttempts);
        }
        if by_account > self.account_limit {
            tracing::warn!(account = name, %address, "Account locked");
            return Err(Error::AccountLocked);
        }
        Ok(())
    }

    /// Records an account creation from `address`.
    pub fn check_registration(&self, address: IpAddr) -> Result<()> {
        let mut counters = self.counters();
        let count = counters.registrations.entry(address).or_default();
        *count += 1;
        if *count > self.registration_limit {
            tracing::warn!(%address, "Registration limit reached");
            return Err(Error::TooManyAttempts);
        }
        Ok(())
    }

    pub fn reset(&self) {
        *self.counters() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> AttemptGuard {
        AttemptGuard::new(&ProtectionConfig {
            ip: 10,
            account: 5,
            registration: 2,
            reset: 60,
        })
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn test_account_threshold() {
        let guard = guard();
        for _ in 0..5 {
            guard.check("alice", addr(1)).unwrap();
        }
        assert!(matches!(
            guard.check("ALICE", addr(2)),
            Err(Error::AccountLocked)
        ));
        guard.check("bob", addr(2)).unwrap();
    }

    #[test]
    fn test_address_threshold_covers_every_account() {
        let guard = guard();
        for i in 0..10 {
            let _ = guard.check(if i < 5 { "alice" } else { "carol" }, addr(1));
        }
        assert!(matches!(
            guard.check("bob", addr(1)),
            Err(Error::TooManyAttempts)
        ));
        guard.check("bob", addr(9)).unwrap();
    }

    #[test]
    fn test_reset_restarts_counters() {
        let guard = guard();
        for _ in 0..11 {
            let _ = guard.check("alice", addr(1));
        }
        assert!(guard.check("alice", addr(1)).is_err());

        guard.reset();
        guard.check("alice", addr(1)).unwrap();
    }

    #[test]
    fn test_registration_limit() {
        let guard = guard();
        guard.check_registration(addr(1)).unwrap();
        guard.check_registration(addr(1)).unwrap();
        assert!(matches!(
            guard.check_registration(addr(1)),
            Err(Error::TooManyAttempts)
        ));
    }
}
