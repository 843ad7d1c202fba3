use super::{Request, Response, account, browse};
use crate::error::Result;
use crate::server::AppState;

/// Dispatches one request. Errors become gemini failure statuses here.
pub async fn handle(state: &AppState, request: Request) -> Response {
    match route(state, &request).await {
        Ok(response) => response,
        Err(err) => {
            if err.is_auth_failure() {
                tracing::debug!(path = %request.path, "{err}");
            }
            Response::from(err)
        }
    }
}

async fn route(state: &AppState, request: &Request) -> Result<Response> {
    let segments: Vec<&str> = request
        .path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match segments.as_slice() {
        [] => browse::home(state, request),
        ["repo"] => browse::public_repos(state),
        ["repo", owner] => browse::user_repos(state, request, owner),
        ["repo", owner, repo, rest @ ..] => browse::repo(state, request, owner, repo, rest),
        ["register"] => account::register(state, request, None),
        ["register", name] => account::register(state, request, Some(name)),
        ["login"] => account::login(state, request, None).await,
        ["login", name] => account::login(state, request, Some(name)).await,
        ["otp"] => account::login_otp(state, request),
        ["account"] => account::enter(state, request),
        ["account", token, rest @ ..] => account::dispatch(state, request, token, rest).await,
        _ => Ok(Response::not_found()),
    }
}
