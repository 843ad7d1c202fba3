use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Privilege;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    /// Absent when authentication is delegated to the directory service.
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Base32 TOTP secret; `None` when no second factor is enrolled.
    #[serde(skip)]
    pub totp_secret: Option<String>,
    pub secure_transfer: bool,
}

impl User {
    #[must_use]
    pub fn has_otp(&self) -> bool {
        self.totp_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub group_id: i64,
    pub user_id: i64,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub owner_id: i64,
    pub owner_name: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub public: bool,
    pub secure_transfer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessSubject {
    User(i64),
    Group(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub repo_id: i64,
    pub subject: AccessSubject,
    /// Name of the user or group the grant refers to.
    pub subject_name: String,
    pub privilege: Privilege,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub fingerprint: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub pending_otp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip)]
    pub hash: String,
    /// First characters of the plaintext, shown so users can tell tokens apart.
    pub hint: String,
    pub expires_at: DateTime<Utc>,
    pub read_only: bool,
}

impl Token {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Fields of a token row before the database assigns its id.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub user_id: i64,
    pub hash: String,
    pub hint: String,
    pub expires_at: DateTime<Utc>,
    pub read_only: bool,
}
