//! Authorization shared by the smart HTTP and SSH transfer gateways.

use std::net::IpAddr;
use std::path::PathBuf;

use super::AppState;
use crate::auth::access;
use crate::error::Error;
use crate::git::GitService;
use crate::types::{Repo, User};

/// What the client presented.
#[derive(Debug, Clone)]
pub enum Credentials {
    Anonymous,
    /// The secret is a token or a password.
    Secret { name: String, secret: String },
}

#[derive(Debug)]
pub enum TransferError {
    /// No credentials were sent and the operation needs some.
    AuthRequired,
    /// Credentials were sent and refused.
    Rejected(Error),
    /// Unknown repository, or one the caller may not see.
    NotFound,
    Internal(Error),
}

impl TransferError {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::AuthRequired => "authentication required".to_string(),
            Self::Rejected(e) | Self::Internal(e) => e.public_message(),
            Self::NotFound => Error::RepoNotFound.to_string(),
        }
    }
}

impl From<Error> for TransferError {
    fn from(err: Error) -> Self {
        if err.is_internal() {
            Self::Internal(err)
        } else {
            Self::Rejected(err)
        }
    }
}

#[derive(Debug)]
pub struct Authorized {
    pub repo: Repo,
    pub user: Option<User>,
    pub path: PathBuf,
}

/// Strips the `.git` suffix clients commonly append.
#[must_use]
pub fn strip_git_suffix(name: &str) -> &str {
    name.strip_suffix(".git").unwrap_or(name)
}

/// Resolves the repository, authenticates the caller and checks the
/// privilege the service needs.
pub async fn authorize(
    state: &AppState,
    owner: &str,
    repo_name: &str,
    service: GitService,
    credentials: Credentials,
    address: IpAddr,
) -> Result<Authorized, TransferError> {
    let want_write = service.is_write();
    let repo = state
        .store
        .get_repo(owner, strip_git_suffix(repo_name))
        .map_err(TransferError::Internal)?
        .ok_or(TransferError::NotFound)?;

    let user = match credentials {
        Credentials::Anonymous if !want_write && repo.public => None,
        Credentials::Anonymous => return Err(TransferError::AuthRequired),
        Credentials::Secret { name, secret } => {
            let user = state
                .auth
                .transfer_login(&name, &secret, &repo, want_write, address)
                .await?;
            Some(user)
        }
    };

    let allowed = if want_write {
        access::has_write(state.store.as_ref(), user.as_ref(), &repo)
    } else {
        access::has_read(state.store.as_ref(), user.as_ref(), &repo)
    }
    .map_err(TransferError::Internal)?;

    if !allowed {
        tracing::warn!(
            user = user.as_ref().map(|u| u.name.as_str()),
            owner = %repo.owner_name,
            repo = %repo.name,
            service = service.command_name(),
            "Transfer denied"
        );
        return Err(TransferError::NotFound);
    }

    let path = state.storage.repo_path(&repo.owner_name, &repo.name);
    Ok(Authorized { repo, user, path })
}
