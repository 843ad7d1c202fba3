//! Identity mutations issued from a hypertext session.
//!
//! Every operation takes the acting user snapshot and the certificate
//! fingerprint of the request, and re-checks that the fingerprint still
//! belongs to that user before touching the store. Changes to the user row
//! are mirrored into the session cache in the same call, and repository
//! renames and deletions are applied to the on-disk tree only after the
//! owner check in the store has passed.

use std::sync::Arc;

use crate::auth::SessionCache;
use crate::error::{Error, Result};
use crate::git::RepoStorage;
use crate::store::Store;
use crate::types::{Group, Privilege, Repo, User};

pub struct IdentityService {
    store: Arc<dyn Store>,
    sessions: Arc<SessionCache>,
    storage: RepoStorage,
}

impl IdentityService {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionCache>, storage: RepoStorage) -> Self {
        Self {
            store,
            sessions,
            storage,
        }
    }

    /// Fails unless `fingerprint` is an authenticated session of `user`.
    pub fn check_signature(&self, user: &User, fingerprint: &str) -> Result<()> {
        match self.sessions.user(fingerprint)? {
            None => Err(Error::WrongSignature),
            Some(current) if current.id != user.id => Err(Error::SignatureMismatch),
            Some(_) => Ok(()),
        }
    }

    fn refresh(&self, user_id: i64) -> Result<User> {
        let user = self.store.get_user(user_id)?.ok_or(Error::UserNotFound)?;
        self.sessions.update_user(&user);
        Ok(user)
    }

    // Account

    pub fn change_password(&self, user: &User, fingerprint: &str, password_hash: &str) -> Result<User> {
        self.check_signature(user, fingerprint)?;
        self.store.update_password(user.id, password_hash)?;
        tracing::info!(user = %user.name, "Password changed");
        self.refresh(user.id)
    }

    pub fn change_description(&self, user: &User, fingerprint: &str, description: &str) -> Result<User> {
        self.check_signature(user, fingerprint)?;
        self.store.update_user_description(user.id, description)?;
        self.refresh(user.id)
    }

    /// Stores or clears the TOTP secret.
    pub fn set_secret(&self, user: &User, fingerprint: &str, secret: Option<&str>) -> Result<User> {
        self.check_signature(user, fingerprint)?;
        self.store.set_totp_secret(user.id, secret)?;
        tracing::info!(user = %user.name, enabled = secret.is_some(), "Second factor updated");
        self.refresh(user.id)
    }

    pub fn toggle_secure_transfer(&self, user: &User, fingerprint: &str) -> Result<User> {
        self.check_signature(user, fingerprint)?;
        self.store
            .set_user_secure_transfer(user.id, !user.secure_transfer)?;
        self.refresh(user.id)
    }

    // Repositories

    fn owned_repo(&self, user: &User, name: &str) -> Result<Repo> {
        self.store
            .get_repo(&user.name, name)?
            .ok_or(Error::RepoNotFound)
    }

    pub fn create_repo(&self, user: &User, fingerprint: &str, name: &str, description: &str) -> Result<Repo> {
        self.check_signature(user, fingerprint)?;
        let repo = self.store.create_repo(user.id, name, description)?;

        if let Err(e) = self.storage.init(&user.name, &repo.name) {
            self.store.delete_repo(user.id, repo.id)?;
            return Err(e);
        }
        tracing::info!(owner = %user.name, repo = %repo.name, "Repository created");
        Ok(repo)
    }

    pub fn rename_repo(&self, user: &User, fingerprint: &str, name: &str, new_name: &str) -> Result<Repo> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, name)?;
        self.store.rename_repo(user.id, repo.id, new_name)?;
        self.storage.rename(&user.name, &repo.name, new_name)?;
        tracing::info!(owner = %user.name, from = %repo.name, to = new_name, "Repository renamed");
        self.store.get_repo_by_id(repo.id)?.ok_or(Error::RepoNotFound)
    }

    pub fn set_repo_description(&self, user: &User, fingerprint: &str, name: &str, description: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, name)?;
        self.store.set_repo_description(user.id, repo.id, description)
    }

    pub fn toggle_repo_public(&self, user: &User, fingerprint: &str, name: &str) -> Result<bool> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, name)?;
        self.store.toggle_repo_public(user.id, repo.id)
    }

    pub fn toggle_repo_secure_transfer(&self, user: &User, fingerprint: &str, name: &str) -> Result<bool> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, name)?;
        self.store.toggle_repo_secure_transfer(user.id, repo.id)
    }

    pub fn delete_repo(&self, user: &User, fingerprint: &str, name: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, name)?;
        self.store.delete_repo(user.id, repo.id)?;
        self.storage.remove(&user.name, &repo.name)?;
        tracing::info!(owner = %user.name, repo = %repo.name, "Repository deleted");
        Ok(())
    }

    // Access grants

    pub fn add_user_access(&self, user: &User, fingerprint: &str, repo: &str, target: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, repo)?;
        self.store.add_user_access(user.id, repo.id, target)
    }

    pub fn add_group_access(&self, user: &User, fingerprint: &str, repo: &str, group: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, repo)?;
        self.store.add_group_access(user.id, repo.id, group)
    }

    pub fn set_user_access(
        &self,
        user: &User,
        fingerprint: &str,
        repo: &str,
        target: &str,
        privilege: Privilege,
    ) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, repo)?;
        self.store.set_user_access(user.id, repo.id, target, privilege)
    }

    pub fn set_group_access(
        &self,
        user: &User,
        fingerprint: &str,
        repo: &str,
        group: &str,
        privilege: Privilege,
    ) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, repo)?;
        self.store.set_group_access(user.id, repo.id, group, privilege)
    }

    pub fn remove_user_access(&self, user: &User, fingerprint: &str, repo: &str, target: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, repo)?;
        self.store.remove_user_access(user.id, repo.id, target)
    }

    pub fn remove_group_access(&self, user: &User, fingerprint: &str, repo: &str, group: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let repo = self.owned_repo(user, repo)?;
        self.store.remove_group_access(user.id, repo.id, group)
    }

    // Groups

    fn group(&self, name: &str) -> Result<Group> {
        self.store.get_group(name)?.ok_or(Error::GroupNotFound)
    }

    pub fn create_group(&self, user: &User, fingerprint: &str, name: &str, description: &str) -> Result<Group> {
        self.check_signature(user, fingerprint)?;
        let group = self.store.create_group(user.id, name, description)?;
        tracing::info!(owner = %user.name, group = %group.name, "Group created");
        Ok(group)
    }

    pub fn delete_group(&self, user: &User, fingerprint: &str, name: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let group = self.group(name)?;
        self.store.delete_group(user.id, group.id)
    }

    pub fn set_group_description(&self, user: &User, fingerprint: &str, name: &str, description: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let group = self.group(name)?;
        self.store.set_group_description(user.id, group.id, description)
    }

    pub fn add_group_member(&self, user: &User, fingerprint: &str, name: &str, member: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let group = self.group(name)?;
        self.store.add_group_member(user.id, group.id, member)
    }

    /// Removes `member`; the owner may remove anyone but themselves, other
    /// members only themselves.
    pub fn remove_group_member(&self, user: &User, fingerprint: &str, name: &str, member: &str) -> Result<()> {
        self.check_signature(user, fingerprint)?;
        let group = self.group(name)?;
        self.store.remove_group_member(user.id, group.id, member)
    }

    // Administration

    /// Deletes an account with its repositories, on disk included.
    pub fn delete_user(&self, name: &str) -> Result<()> {
        let user = self
            .store
            .get_user_by_name(name)?
            .ok_or(Error::UserNotFound)?;
        self.store.delete_user(user.id)?;
        self.sessions.forget_user(user.id);
        self.storage.remove_owner(&user.name)?;
        tracing::info!(user = %user.name, "User deleted");
        Ok(())
    }
}
