//! Smart HTTP transfer gateway.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use async_compression::tokio::bufread::GzipDecoder;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use super::AppState;
use super::transfer::{Credentials, TransferError, authorize};
use crate::git::{GitService, format_pkt_line_header, run_stateless};

const REALM: &str = "Basic realm=\"gemforge\"";

#[derive(Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

#[derive(Deserialize)]
pub struct RepoPath {
    owner: String,
    repo: String,
}

/// Peer address when the server was started with connect info, unspecified
/// otherwise.
pub struct ClientAddr(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let address = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Ok(Self(address))
    }
}

/// Reads HTTP Basic credentials. A missing or malformed header counts as
/// anonymous.
pub fn extract_credentials(headers: &HeaderMap) -> Credentials {
    let decoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| STANDARD.decode(v.trim()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());

    match decoded.as_deref().and_then(|s| s.split_once(':')) {
        Some((name, secret)) => Credentials::Secret {
            name: name.to_string(),
            secret: secret.to_string(),
        },
        None => Credentials::Anonymous,
    }
}

fn transfer_error_response(err: TransferError) -> Response {
    match err {
        TransferError::AuthRequired | TransferError::Rejected(_) => {
            let mut response = (StatusCode::UNAUTHORIZED, err.message()).into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
            response
        }
        TransferError::NotFound => (StatusCode::NOT_FOUND, err.message()).into_response(),
        TransferError::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.message()).into_response()
        }
    }
}

fn build_git_response(body: Vec<u8>, content_type: &'static str) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn git_failure(service: GitService, detail: &dyn std::fmt::Display) -> Response {
    tracing::warn!("{} failed: {detail}", service.command_name());
    (StatusCode::INTERNAL_SERVER_ERROR, "Git command failed").into_response()
}

pub async fn info_refs(
    State(state): State<Arc<AppState>>,
    Path(params): Path<RepoPath>,
    Query(query): Query<InfoRefsQuery>,
    ClientAddr(address): ClientAddr,
    headers: HeaderMap,
) -> Response {
    let Some(service) = query.service.as_deref().and_then(GitService::from_name) else {
        return (StatusCode::NOT_FOUND, "Invalid service").into_response();
    };

    let credentials = extract_credentials(&headers);
    let authorized =
        match authorize(&state, &params.owner, &params.repo, service, credentials, address).await {
            Ok(a) => a,
            Err(e) => return transfer_error_response(e),
        };

    let output = match run_stateless(&authorized.path, service, true, None).await {
        Ok(o) => o,
        Err(e) => return git_failure(service, &e),
    };
    if !output.status.success() {
        return git_failure(service, &String::from_utf8_lossy(&output.stderr));
    }

    let mut body = format_pkt_line_header(service);
    body.extend_from_slice(&output.stdout);
    build_git_response(body, service.advertisement_content_type())
}

async fn service_rpc(
    state: &AppState,
    service: GitService,
    params: RepoPath,
    address: IpAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let credentials = extract_credentials(&headers);
    let authorized =
        match authorize(state, &params.owner, &params.repo, service, credentials, address).await {
            Ok(a) => a,
            Err(e) => return transfer_error_response(e),
        };

    let input = match decompress_if_gzip(&headers, body).await {
        Ok(data) => data,
        Err(e) => return e,
    };

    let output = match run_stateless(&authorized.path, service, false, Some(&input)).await {
        Ok(o) => o,
        Err(e) => return git_failure(service, &e),
    };

    if service.is_write() {
        tracing::info!(
            user = authorized.user.as_ref().map(|u| u.name.as_str()),
            owner = %authorized.repo.owner_name,
            repo = %authorized.repo.name,
            "Push received"
        );
    }
    build_git_response(output.stdout, service.content_type())
}

pub async fn git_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(params): Path<RepoPath>,
    ClientAddr(address): ClientAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service_rpc(&state, GitService::UploadPack, params, address, headers, body).await
}

pub async fn git_receive_pack(
    State(state): State<Arc<AppState>>,
    Path(params): Path<RepoPath>,
    ClientAddr(address): ClientAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service_rpc(&state, GitService::ReceivePack, params, address, headers, body).await
}

async fn decompress_if_gzip(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, Response> {
    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());

    if content_encoding == Some("gzip") {
        let reader = std::io::Cursor::new(body);
        let mut decoder = GzipDecoder::new(tokio::io::BufReader::new(reader));
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .await
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid gzip body").into_response())?;

        Ok(decompressed)
    } else {
        Ok(body.to_vec())
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        response.status().as_u16(),
        start.elapsed().as_millis()
    );
    response
}

fn transfer_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{owner}/{repo}/info/refs", get(info_refs))
        .route("/{owner}/{repo}/git-upload-pack", post(git_upload_pack))
        .route("/{owner}/{repo}/git-receive-pack", post(git_receive_pack))
        .layer(DefaultBodyLimit::disable())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(transfer_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.git.http.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Smart HTTP listening on http://{addr}");

    let app = create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
