//! Public browsing. Private repositories are visible to viewers with read
//! access and indistinguishable from missing ones otherwise.

use super::{Request, Response, views};
use crate::auth::access;
use crate::error::{Error, Result};
use crate::git::storage;
use crate::server::AppState;
use crate::types::{Repo, User};

const LOG_LIMIT: usize = 50;

/// The authenticated user behind the request, if any.
pub fn viewer(state: &AppState, request: &Request) -> Result<Option<User>> {
    let Some(fingerprint) = request.fingerprint.as_deref() else {
        return Ok(None);
    };
    Ok(state.sessions.get(fingerprint)?.authenticated().cloned())
}

pub fn home(state: &AppState, request: &Request) -> Result<Response> {
    let user = viewer(state, request)?;
    Ok(Response::gemtext(views::home(
        state.auth.registration_open(),
        user.as_ref(),
    )))
}

pub fn public_repos(state: &AppState) -> Result<Response> {
    let repos = state.store.list_public_repos()?;
    Ok(Response::gemtext(views::repo_list("Public repositories", &repos)))
}

pub fn user_repos(state: &AppState, request: &Request, owner: &str) -> Result<Response> {
    let owner = state
        .store
        .get_user_by_name(owner)?
        .ok_or(Error::UserNotFound)?;
    let is_owner = viewer(state, request)?.is_some_and(|u| u.id == owner.id);
    let repos = state.store.list_user_repos(owner.id, !is_owner)?;
    Ok(Response::gemtext(views::repo_list(
        &format!("Repositories of {}", owner.name),
        &repos,
    )))
}

fn clone_urls(state: &AppState, repo: &Repo) -> Vec<String> {
    let config = &state.config;
    let host = &config.gemini.host;
    let mut urls = Vec::new();
    if config.git.http.enabled {
        urls.push(format!(
            "http://{host}:{}/{}/{}",
            config.git.http.port, repo.owner_name, repo.name
        ));
    }
    if config.git.remote.enabled {
        urls.push(format!(
            "ssh://{host}:{}/{}/{}",
            config.git.remote.port, repo.owner_name, repo.name
        ));
    }
    urls
}

pub fn repo(
    state: &AppState,
    request: &Request,
    owner: &str,
    name: &str,
    rest: &[&str],
) -> Result<Response> {
    let repo = state
        .store
        .get_repo(owner, name)?
        .ok_or(Error::RepoNotFound)?;
    let user = viewer(state, request)?;
    if !access::has_read(state.store.as_ref(), user.as_ref(), &repo)? {
        return Err(Error::RepoNotFound);
    }

    if rest.is_empty() {
        return Ok(Response::gemtext(views::repo_summary(
            &repo,
            &clone_urls(state, &repo),
        )));
    }

    let git = state.storage.open(&repo.owner_name, &repo.name)?;
    let response = match rest {
        ["files"] => Response::gemtext(views::files(&repo, &storage::list_files(&git)?)),
        ["files", hash] => match storage::blob(&git, hash)? {
            Some(content) => Response::Success {
                mime: if storage::is_binary(&content) {
                    "application/octet-stream"
                } else {
                    "text/plain; charset=utf-8"
                },
                body: content,
            },
            None => Response::not_found(),
        },
        ["log"] => Response::gemtext(views::log(&repo, &storage::log(&git, LOG_LIMIT)?)),
        ["refs"] => Response::gemtext(views::refs(&repo, &storage::refs(&git)?)),
        ["license"] => root_document(&repo, &git, "license")?,
        ["readme"] => root_document(&repo, &git, "readme")?,
        _ => Response::not_found(),
    };
    Ok(response)
}

fn root_document(repo: &Repo, git: &git2::Repository, prefix: &str) -> Result<Response> {
    Ok(match storage::find_root_file(git, prefix)? {
        Some((name, content)) => Response::gemtext(views::document(repo, &name, &content)),
        None => Response::NotFound(format!("no {prefix} file")),
    })
}
