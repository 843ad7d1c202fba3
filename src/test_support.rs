use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tempfile::TempDir;

use crate::auth::{Backend, PasswordHasher};
use crate::config::Config;
use crate::server::AppState;
use crate::store::{SqliteStore, Store};

pub const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

pub fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.database.url = temp.path().join("test.db").to_string_lossy().into_owned();
    config.git.root = temp.path().join("repos");
    config
}

/// State over a fresh database and repository root, with a cheap hasher.
pub fn test_state() -> (TempDir, AppState) {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let store = SqliteStore::new(&config.database.url).unwrap();
    store.initialize().unwrap();
    let backend = Backend::Local(PasswordHasher::with_params(8, 1).unwrap());
    let state = AppState::new(config, Arc::new(store), backend);
    (temp, state)
}
