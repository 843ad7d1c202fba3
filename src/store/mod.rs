mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// Store is the identity database. Mutations that carry a `user_id` caller
/// perform their ownership check in the same transaction as the write.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // User operations
    fn create_user(&self, name: &str, password_hash: Option<&str>) -> Result<User>;
    fn get_user(&self, id: i64) -> Result<Option<User>>;
    fn get_user_by_name(&self, name: &str) -> Result<Option<User>>;
    fn list_users(&self) -> Result<Vec<User>>;
    fn delete_user(&self, id: i64) -> Result<bool>;
    fn update_password(&self, user_id: i64, password_hash: &str) -> Result<()>;
    fn update_user_description(&self, user_id: i64, description: &str) -> Result<()>;
    fn set_totp_secret(&self, user_id: i64, secret: Option<&str>) -> Result<()>;
    fn set_user_secure_transfer(&self, user_id: i64, enabled: bool) -> Result<()>;

    // Repo operations
    fn create_repo(&self, owner_id: i64, name: &str, description: &str) -> Result<Repo>;
    fn get_repo(&self, owner_name: &str, name: &str) -> Result<Option<Repo>>;
    fn get_repo_by_id(&self, id: i64) -> Result<Option<Repo>>;
    fn list_user_repos(&self, owner_id: i64, only_public: bool) -> Result<Vec<Repo>>;
    fn list_public_repos(&self) -> Result<Vec<Repo>>;
    fn rename_repo(&self, user_id: i64, repo_id: i64, new_name: &str) -> Result<()>;
    fn set_repo_description(&self, user_id: i64, repo_id: i64, description: &str) -> Result<()>;
    fn toggle_repo_public(&self, user_id: i64, repo_id: i64) -> Result<bool>;
    fn toggle_repo_secure_transfer(&self, user_id: i64, repo_id: i64) -> Result<bool>;
    fn delete_repo(&self, user_id: i64, repo_id: i64) -> Result<()>;
    /// Repositories the user reaches through a direct or group grant of at
    /// least read, excluding the ones they own.
    fn repos_with_read_access(&self, user_id: i64) -> Result<Vec<Repo>>;

    // Group operations
    fn create_group(&self, owner_id: i64, name: &str, description: &str) -> Result<Group>;
    fn get_group(&self, name: &str) -> Result<Option<Group>>;
    fn delete_group(&self, user_id: i64, group_id: i64) -> Result<()>;
    fn set_group_description(&self, user_id: i64, group_id: i64, description: &str) -> Result<()>;
    fn add_group_member(&self, user_id: i64, group_id: i64, member_name: &str) -> Result<()>;
    fn remove_group_member(&self, user_id: i64, group_id: i64, member_name: &str) -> Result<()>;
    fn list_group_members(&self, group_id: i64) -> Result<Vec<Member>>;
    fn get_group_owner(&self, group_id: i64) -> Result<Option<User>>;
    fn list_user_groups(&self, user_id: i64) -> Result<Vec<Group>>;

    // Access grant operations
    fn add_user_access(&self, user_id: i64, repo_id: i64, target_name: &str) -> Result<()>;
    fn add_group_access(&self, user_id: i64, repo_id: i64, group_name: &str) -> Result<()>;
    fn set_user_access(
        &self,
        user_id: i64,
        repo_id: i64,
        target_name: &str,
        privilege: Privilege,
    ) -> Result<()>;
    fn set_group_access(
        &self,
        user_id: i64,
        repo_id: i64,
        group_name: &str,
        privilege: Privilege,
    ) -> Result<()>;
    fn remove_user_access(&self, user_id: i64, repo_id: i64, target_name: &str) -> Result<()>;
    fn remove_group_access(&self, user_id: i64, repo_id: i64, group_name: &str) -> Result<()>;
    fn list_repo_access(&self, repo_id: i64) -> Result<Vec<AccessGrant>>;
    fn get_user_access(&self, repo_id: i64, user_id: i64) -> Result<Option<Privilege>>;
    /// Highest privilege granted on the repo to any group containing the user.
    fn get_group_access_for_user(&self, repo_id: i64, user_id: i64) -> Result<Option<Privilege>>;

    // Session operations
    fn create_session(&self, fingerprint: &str, user_id: i64, pending_otp: bool) -> Result<Session>;
    fn get_session(&self, fingerprint: &str) -> Result<Option<(Session, User)>>;
    fn confirm_session(&self, fingerprint: &str) -> Result<bool>;
    fn delete_session(&self, fingerprint: &str) -> Result<bool>;
    fn delete_user_sessions(&self, user_id: i64, keep: Option<&str>) -> Result<usize>;
    fn delete_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // Token operations
    fn create_token(&self, token: &NewToken) -> Result<Token>;
    fn list_user_tokens(&self, user_id: i64) -> Result<Vec<Token>>;
    fn get_token_for_user(&self, user_name: &str, hash: &str) -> Result<Option<Token>>;
    fn set_token_expiry(&self, user_id: i64, token_id: i64, expires_at: DateTime<Utc>) -> Result<()>;
    fn delete_token(&self, user_id: i64, token_id: i64) -> Result<()>;
}
