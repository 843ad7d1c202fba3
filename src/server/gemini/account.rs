//! Registration, login and the `/account/<token>/...` pages.

use chrono::Utc;

use super::{Request, Response, views};
use crate::auth::{LoginOutcome, SessionState, otp};
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::types::{Privilege, User};

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

pub fn register(state: &AppState, request: &Request, name: Option<&str>) -> Result<Response> {
    if !state.auth.registration_open() {
        return Err(Error::RegistrationClosed);
    }
    let Some(name) = name else {
        return Ok(match request.input() {
            None => Response::Input("user name".to_string()),
            Some(name) => Response::redirect(format!("/register/{}", encode(name))),
        });
    };
    let Some(password) = request.input() else {
        return Ok(Response::SensitiveInput("password".to_string()));
    };

    let user = state.auth.register(name, password, request.peer)?;
    Ok(Response::redirect(format!("/login/{}", encode(&user.name))))
}

pub async fn login(state: &AppState, request: &Request, name: Option<&str>) -> Result<Response> {
    let Some(fingerprint) = request.fingerprint.as_deref() else {
        return Ok(Response::certificate_required());
    };
    let Some(name) = name else {
        return Ok(match request.input() {
            None => Response::Input("user name".to_string()),
            Some(name) => Response::redirect(format!("/login/{}", encode(name))),
        });
    };
    let Some(password) = request.input() else {
        return Ok(Response::SensitiveInput("password".to_string()));
    };

    Ok(
        match state
            .auth
            .login(name, password, fingerprint, request.peer)
            .await?
        {
            LoginOutcome::Authenticated(_) => Response::redirect("/account/"),
            LoginOutcome::AwaitOtp(_) => Response::redirect("/otp"),
        },
    )
}

pub fn login_otp(state: &AppState, request: &Request) -> Result<Response> {
    let Some(fingerprint) = request.fingerprint.as_deref() else {
        return Ok(Response::certificate_required());
    };
    let Some(code) = request.input() else {
        return Ok(Response::Input("one-time code".to_string()));
    };
    state.auth.login_otp(fingerprint, code, request.peer)?;
    Ok(Response::redirect("/account/"))
}

/// `/account/`: hands out a fresh path token by redirect.
pub fn enter(state: &AppState, request: &Request) -> Result<Response> {
    let Some(fingerprint) = request.fingerprint.as_deref() else {
        return Ok(Response::certificate_required());
    };
    Ok(match state.sessions.get(fingerprint)? {
        SessionState::Anonymous => Response::redirect("/login"),
        SessionState::AwaitOtp(_) => Response::redirect("/otp"),
        SessionState::Authenticated(_) => match state.csrf.issue(fingerprint)? {
            Some(token) => Response::redirect(format!("/account/{token}/")),
            None => Response::redirect("/login"),
        },
    })
}

/// Routes below `/account/<token>/`. A missing, stale or foreign token sends
/// the client back to `/`.
pub async fn dispatch(state: &AppState, request: &Request, token: &str, rest: &[&str]) -> Result<Response> {
    let Some(fingerprint) = request.fingerprint.as_deref() else {
        return Ok(Response::certificate_required());
    };
    if !state.csrf.verify(fingerprint, token)? {
        return Ok(Response::redirect("/"));
    }
    let Some(user) = state.sessions.user(fingerprint)? else {
        return Ok(Response::redirect("/"));
    };

    let account = Account {
        state,
        request,
        fingerprint,
        user,
        base: format!("/account/{token}/"),
    };
    match rest {
        [] => account.overview(),
        ["addrepo"] => account.add_repo(),
        ["chpasswd", step @ ..] => account.change_password(step).await,
        ["chdesc"] => account.change_description(),
        ["disconnect"] => account.disconnect(),
        ["disconnect-all"] => account.disconnect_all(),
        ["repo", repo, action @ ..] => account.repo(repo, action),
        ["addgroup"] => account.add_group(),
        ["groups", group, action @ ..] => account.group(group, action),
        ["otp", action @ ..] => account.otp(action),
        ["token", action @ ..] => account.token(action),
        _ => Ok(Response::not_found()),
    }
}

struct Account<'a> {
    state: &'a AppState,
    request: &'a Request,
    fingerprint: &'a str,
    user: User,
    base: String,
}

impl Account<'_> {
    fn to(&self, path: &str) -> Response {
        Response::redirect(format!("{}{path}", self.base))
    }

    fn prompt(&self, prompt: &str) -> Option<Response> {
        match self.request.input() {
            Some(_) => None,
            None => Some(Response::Input(prompt.to_string())),
        }
    }

    fn input(&self) -> &str {
        self.request.input().unwrap_or_default()
    }

    fn overview(&self) -> Result<Response> {
        let store = &self.state.store;
        let repos = store.list_user_repos(self.user.id, false)?;
        let shared = store.repos_with_read_access(self.user.id)?;
        let groups = store.list_user_groups(self.user.id)?;
        Ok(Response::gemtext(views::account(&views::AccountView {
            base: &self.base,
            user: &self.user,
            repos: &repos,
            shared: &shared,
            groups: &groups,
            local_password: !self.state.auth.uses_directory(),
        })))
    }

    fn add_repo(&self) -> Result<Response> {
        if let Some(prompt) = self.prompt("repository name") {
            return Ok(prompt);
        }
        let repo = self
            .state
            .identity
            .create_repo(&self.user, self.fingerprint, self.input(), "")?;
        Ok(self.to(&format!("repo/{}", repo.name)))
    }

    /// `chpasswd` checks the current password, `chpasswd/new` takes the
    /// replacement.
    async fn change_password(&self, step: &[&str]) -> Result<Response> {
        let auth = &self.state.auth;
        match step {
            [] => {
                let Some(current) = self.request.input() else {
                    return Ok(Response::SensitiveInput("current password".to_string()));
                };
                auth.confirm_password(&self.user, current, self.fingerprint, self.request.peer)
                    .await?;
                Ok(self.to("chpasswd/new"))
            }
            ["new"] => {
                let Some(password) = self.request.input() else {
                    return Ok(Response::SensitiveInput("new password".to_string()));
                };
                if !auth.take_confirmation(self.fingerprint, &self.user) {
                    return Ok(self.to("chpasswd"));
                }
                let hash = auth.hash_password(password)?;
                self.state
                    .identity
                    .change_password(&self.user, self.fingerprint, &hash)?;
                Ok(self.to(""))
            }
            _ => Ok(Response::not_found()),
        }
    }

    fn change_description(&self) -> Result<Response> {
        if let Some(prompt) = self.prompt("description") {
            return Ok(prompt);
        }
        self.state
            .identity
            .change_description(&self.user, self.fingerprint, self.input())?;
        Ok(self.to(""))
    }

    fn disconnect(&self) -> Result<Response> {
        self.state
            .identity
            .check_signature(&self.user, self.fingerprint)?;
        self.state.otp.cancel(self.fingerprint);
        self.state.sessions.invalidate(self.fingerprint)?;
        tracing::info!(user = %self.user.name, "Session closed");
        Ok(Response::redirect("/"))
    }

    fn disconnect_all(&self) -> Result<Response> {
        self.state
            .identity
            .check_signature(&self.user, self.fingerprint)?;
        let closed = self
            .state
            .sessions
            .invalidate_all_for(self.user.id, Some(self.fingerprint))?;
        tracing::info!(user = %self.user.name, closed, "Other sessions closed");
        Ok(self.to(""))
    }

    fn repo(&self, name: &str, action: &[&str]) -> Result<Response> {
        let identity = &self.state.identity;
        let (user, fp) = (&self.user, self.fingerprint);
        let admin = format!("repo/{name}");

        match action {
            [] => {
                let repo = self
                    .state
                    .store
                    .get_repo(&user.name, name)?
                    .ok_or(Error::RepoNotFound)?;
                let grants = self.state.store.list_repo_access(repo.id)?;
                Ok(Response::gemtext(views::repo_admin(&self.base, &repo, &grants)))
            }
            ["togglepublic"] => {
                identity.toggle_repo_public(user, fp, name)?;
                Ok(self.to(&admin))
            }
            ["togglesecure"] => {
                identity.toggle_repo_secure_transfer(user, fp, name)?;
                Ok(self.to(&admin))
            }
            ["chname"] => {
                if let Some(prompt) = self.prompt("new repository name") {
                    return Ok(prompt);
                }
                let repo = identity.rename_repo(user, fp, name, self.input())?;
                Ok(self.to(&format!("repo/{}", repo.name)))
            }
            ["chdesc"] => {
                if let Some(prompt) = self.prompt("description") {
                    return Ok(prompt);
                }
                identity.set_repo_description(user, fp, name, self.input())?;
                Ok(self.to(&admin))
            }
            ["delrepo"] => {
                if let Some(prompt) = self.prompt(&format!("type {name} to confirm")) {
                    return Ok(prompt);
                }
                if self.input() != name {
                    return Ok(Response::TemporaryFailure(
                        "confirmation does not match".to_string(),
                    ));
                }
                identity.delete_repo(user, fp, name)?;
                Ok(self.to(""))
            }
            ["access", "adduser"] => {
                if let Some(prompt) = self.prompt("user name") {
                    return Ok(prompt);
                }
                identity.add_user_access(user, fp, name, self.input())?;
                Ok(self.to(&admin))
            }
            ["access", "addgroup"] => {
                if let Some(prompt) = self.prompt("group name") {
                    return Ok(prompt);
                }
                identity.add_group_access(user, fp, name, self.input())?;
                Ok(self.to(&admin))
            }
            ["access", "user", target, "remove"] => {
                identity.remove_user_access(user, fp, name, target)?;
                Ok(self.to(&admin))
            }
            ["access", "group", target, "remove"] => {
                identity.remove_group_access(user, fp, name, target)?;
                Ok(self.to(&admin))
            }
            ["access", kind, target, privilege] => {
                let Some(privilege) = Privilege::parse(privilege) else {
                    return Ok(Response::not_found());
                };
                match *kind {
                    "user" => identity.set_user_access(user, fp, name, target, privilege)?,
                    "group" => identity.set_group_access(user, fp, name, target, privilege)?,
                    _ => return Ok(Response::not_found()),
                }
                Ok(self.to(&admin))
            }
            _ => Ok(Response::not_found()),
        }
    }

    fn add_group(&self) -> Result<Response> {
        if let Some(prompt) = self.prompt("group name") {
            return Ok(prompt);
        }
        let group = self
            .state
            .identity
            .create_group(&self.user, self.fingerprint, self.input(), "")?;
        Ok(self.to(&format!("groups/{}", group.name)))
    }

    fn group(&self, name: &str, action: &[&str]) -> Result<Response> {
        let identity = &self.state.identity;
        let (user, fp) = (&self.user, self.fingerprint);
        let page = format!("groups/{name}");

        match action {
            [] => {
                let store = &self.state.store;
                let group = store.get_group(name)?.ok_or(Error::GroupNotFound)?;
                let members = store.list_group_members(group.id)?;
                if !members.iter().any(|m| m.user_id == user.id) {
                    return Err(Error::GroupNotFound);
                }
                let owner = store.get_group_owner(group.id)?;
                let is_owner = group.owner_id == user.id;
                Ok(Response::gemtext(views::group(
                    &self.base,
                    &group,
                    owner.as_ref(),
                    &members,
                    is_owner,
                )))
            }
            ["add"] => {
                if let Some(prompt) = self.prompt("user name") {
                    return Ok(prompt);
                }
                identity.add_group_member(user, fp, name, self.input())?;
                Ok(self.to(&page))
            }
            ["leave"] => {
                identity.remove_group_member(user, fp, name, &user.name)?;
                Ok(self.to(""))
            }
            ["rm", member] => {
                identity.remove_group_member(user, fp, name, member)?;
                Ok(self.to(&page))
            }
            ["desc"] => {
                if let Some(prompt) = self.prompt("description") {
                    return Ok(prompt);
                }
                identity.set_group_description(user, fp, name, self.input())?;
                Ok(self.to(&page))
            }
            ["delete"] => {
                identity.delete_group(user, fp, name)?;
                Ok(self.to(""))
            }
            _ => Ok(Response::not_found()),
        }
    }

    fn otp(&self, action: &[&str]) -> Result<Response> {
        let enrolments = &self.state.otp;
        let (user, fp) = (&self.user, self.fingerprint);

        match action {
            [] => Ok(Response::gemtext(views::otp(
                &self.base,
                user,
                enrolments.current(fp).as_deref(),
            ))),
            ["enroll"] => {
                self.state.identity.check_signature(user, fp)?;
                let enrolment = enrolments.begin(fp, user)?;
                Ok(Response::gemtext(views::otp_enrolment(&self.base, &enrolment)))
            }
            ["confirm"] => {
                if let Some(prompt) = self.prompt("one-time code") {
                    return Ok(prompt);
                }
                self.state.identity.check_signature(user, fp)?;
                let secret = enrolments.confirm(fp, user, self.input())?;
                self.state.identity.set_secret(user, fp, Some(&secret))?;
                Ok(self.to("otp"))
            }
            ["remove"] => {
                if let Some(prompt) = self.prompt("one-time code") {
                    return Ok(prompt);
                }
                let secret = user.totp_secret.as_deref().ok_or(Error::OtpNotEnabled)?;
                if !otp::verify_code(secret, &user.name, self.input())? {
                    return Err(Error::WrongCode);
                }
                self.state.identity.set_secret(user, fp, None)?;
                Ok(self.to("otp"))
            }
            _ => Ok(Response::not_found()),
        }
    }

    fn token(&self, action: &[&str]) -> Result<Response> {
        let tokens = self.state.auth.tokens();
        let (user, fp) = (&self.user, self.fingerprint);
        if !action.is_empty() {
            self.state.identity.check_signature(user, fp)?;
        }

        match action {
            [] => Ok(Response::gemtext(views::tokens(
                &self.base,
                user,
                &tokens.list(user.id)?,
                Utc::now(),
            ))),
            [scope @ ("new-read" | "new-write")] => {
                let issued = tokens.create(user.id, *scope == "new-read")?;
                Ok(Response::gemtext(views::token_created(
                    &self.base,
                    &issued.plaintext,
                    &issued.token,
                )))
            }
            ["renew", id] => {
                tokens.renew(user.id, parse_id(id)?)?;
                Ok(self.to("token"))
            }
            ["delete", id] => {
                tokens.delete(user.id, parse_id(id)?)?;
                Ok(self.to("token"))
            }
            ["toggle-secure"] => {
                self.state.identity.toggle_secure_transfer(user, fp)?;
                Ok(self.to("token"))
            }
            _ => Ok(Response::not_found()),
        }
    }
}

fn parse_id(id: &str) -> Result<i64> {
    id.parse().map_err(|_| Error::InvalidToken)
}
