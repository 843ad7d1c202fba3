use async_trait::async_trait;
use ldap3::LdapConnAsync;

use crate::config::LdapConfig;
use crate::error::{Error, Result};

/// Outcome of a bind attempt against an external directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Accepted,
    Rejected,
}

/// Credential check delegated to an external identity provider.
#[async_trait]
pub trait DirectoryBind: Send + Sync {
    async fn bind(&self, name: &str, password: &str) -> Result<BindOutcome>;
}

/// Simple bind as `<attribute>=<name>,<binding>`.
pub struct LdapDirectory {
    url: String,
    attribute: String,
    binding: String,
}

impl LdapDirectory {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            url: config.url.clone(),
            attribute: config.attribute.clone(),
            binding: config.binding.clone(),
        }
    }

    fn bind_dn(&self, name: &str) -> String {
        let name = ldap3::dn_escape(name);
        if self.binding.is_empty() {
            format!("{}={name}", self.attribute)
        } else {
            format!("{}={name},{}", self.attribute, self.binding)
        }
    }
}

// LDAP result code for a failed simple bind.
const INVALID_CREDENTIALS: u32 = 49;

#[async_trait]
impl DirectoryBind for LdapDirectory {
    async fn bind(&self, name: &str, password: &str) -> Result<BindOutcome> {
        // An empty password is an unauthenticated bind and always succeeds.
        if password.is_empty() {
            return Ok(BindOutcome::Rejected);
        }

        let (conn, mut ldap) = LdapConnAsync::new(&self.url)
            .await
            .map_err(|e| Error::Directory(e.to_string()))?;
        ldap3::drive!(conn);

        let result = ldap
            .simple_bind(&self.bind_dn(name), password)
            .await
            .map_err(|e| Error::Directory(e.to_string()))?;
        let _ = ldap.unbind().await;

        match result.rc {
            0 => Ok(BindOutcome::Accepted),
            INVALID_CREDENTIALS => Ok(BindOutcome::Rejected),
            rc => Err(Error::Directory(format!("bind failed with code {rc}: {}", result.text))),
        }
    }
}
