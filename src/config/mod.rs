//! Configuration loaded from `gemforge.toml`.

mod server;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use server::{GeminiConfig, HttpConfig, RemoteConfig};

use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "gemforge.toml";
pub const SEARCH_DIRS: &[&str] = &[".", "/etc/gemforge", "/usr/local/etc/gemforge"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gemini: GeminiConfig,
    pub git: GitConfig,
    pub protection: ProtectionConfig,
    pub users: UsersConfig,
    pub ldap: LdapConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: String,
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            url: "gemforge.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Root of the bare repository tree, laid out as `<root>/<owner>/<repo>`.
    pub root: PathBuf,
    pub http: HttpConfig,
    pub remote: RemoteConfig,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("repos"),
            http: HttpConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Attempt guard thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub ip: u32,
    pub account: u32,
    pub registration: u32,
    /// Seconds between counter resets and session sweeps.
    pub reset: u64,
}

impl ProtectionConfig {
    #[must_use]
    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset)
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            ip: 10,
            account: 5,
            registration: 3,
            reset: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsersConfig {
    pub registration: bool,
    pub password_memory_kib: u32,
    pub password_iterations: u32,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            registration: true,
            password_memory_kib: 19 * 1024,
            password_iterations: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub enabled: bool,
    pub url: String,
    /// Attribute holding the user name, e.g. `uid`.
    pub attribute: String,
    /// Base appended to the bind DN, e.g. `ou=users,dc=example,dc=org`.
    pub binding: String,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ldap://localhost:389".to_string(),
            attribute: "uid".to_string(),
            binding: String::new(),
        }
    }
}

impl Config {
    /// Parses a configuration document and applies cross-field rules.
    pub fn parse(source: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&source)
    }

    /// Loads the explicit path when given, otherwise the first
    /// `gemforge.toml` found in the search directories.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, path.to_path_buf()));
        }
        let path = find_config_file(SEARCH_DIRS).ok_or_else(|| {
            Error::Config(format!(
                "{CONFIG_FILE_NAME} not found in {}",
                SEARCH_DIRS.join(", ")
            ))
        })?;
        Ok((Self::from_file(&path)?, path))
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.database.engine != "sqlite" {
            return Err(Error::Config(format!(
                "unsupported database engine '{}'",
                self.database.engine
            )));
        }
        if self.protection.reset == 0 {
            return Err(Error::Config("protection.reset must be positive".into()));
        }
        if self.ldap.enabled {
            if self.users.registration {
                tracing::info!("Directory service enabled, local registration disabled");
            }
            self.users.registration = false;
        }
        Ok(())
    }
}

pub fn find_config_file(dirs: &[&str]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| Path::new(dir).join(CONFIG_FILE_NAME))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.database.engine, "sqlite");
        assert_eq!(config.protection.ip, 10);
        assert!(config.users.registration);
        assert!(!config.git.remote.enabled);
    }

    #[test]
    fn test_ldap_forces_registration_off() {
        let config = Config::parse(
            r#"
            [users]
            registration = true

            [ldap]
            enabled = true
            url = "ldap://directory"
            binding = "ou=people,dc=example,dc=org"
            "#,
        )
        .unwrap();
        assert!(!config.users.registration);
        assert_eq!(config.ldap.attribute, "uid");
    }

    #[test]
    fn test_rejects_unknown_engine() {
        let result = Config::parse("[database]\nengine = \"oracle\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_nested_git_sections() {
        let config = Config::parse(
            r#"
            [git]
            root = "/srv/git"

            [git.remote]
            enabled = true
            port = 2022
            secret = "/etc/gemforge/host_key"

            [protection]
            reset = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.git.root, PathBuf::from("/srv/git"));
        assert!(config.git.remote.enabled);
        assert_eq!(config.git.remote.port, 2022);
        assert_eq!(config.protection.reset_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_find_config_file_in_search_dirs() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("a");
        let second = temp.path().join("b");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join(CONFIG_FILE_NAME), "").unwrap();

        let dirs = [first.to_str().unwrap(), second.to_str().unwrap()];
        assert_eq!(
            find_config_file(&dirs),
            Some(second.join(CONFIG_FILE_NAME))
        );
    }
}
