#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use gemforge::auth::{Backend, PasswordHasher};
use gemforge::config::Config;
use gemforge::server::AppState;
use gemforge::server::gemini::{self, Request, Response};
use gemforge::server::http;
use gemforge::store::{SqliteStore, Store};
use tempfile::TempDir;
use tower::ServiceExt;

pub const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));

/// A forge over a temp directory, driven in-process.
pub struct TestForge {
    pub temp: TempDir,
    pub state: Arc<AppState>,
}

impl TestForge {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let mut config = Config::default();
        config.database.url = temp.path().join("forge.db").to_string_lossy().into_owned();
        config.git.root = temp.path().join("repos");

        let store = SqliteStore::new(&config.database.url).expect("open database");
        store.initialize().expect("initialize database");
        let backend = Backend::Local(PasswordHasher::with_params(8, 1).expect("hasher"));
        let state = Arc::new(AppState::new(config, Arc::new(store), backend));
        Self { temp, state }
    }

    pub async fn gemini(&self, fingerprint: Option<&str>, path: &str, query: Option<&str>) -> Response {
        let mut request = Request::new(path, ADDR);
        if let Some(fp) = fingerprint {
            request = request.with_fingerprint(fp);
        }
        if let Some(q) = query {
            request = request.with_query(q);
        }
        gemini::handle(&self.state, request).await
    }

    /// Logs in over gemini and returns the `/account/<token>/` prefix.
    pub async fn login(&self, name: &str, password: &str, fingerprint: &str) -> String {
        let response = self
            .gemini(Some(fingerprint), &format!("/login/{name}"), Some(password))
            .await;
        assert_eq!(response, Response::redirect("/account/"));
        self.account_base(fingerprint).await
    }

    pub async fn account_base(&self, fingerprint: &str) -> String {
        match self.gemini(Some(fingerprint), "/account/", None).await {
            Response::Redirect(target) => target,
            other => panic!("expected redirect to account, got {other:?}"),
        }
    }

    pub fn http(&self) -> Router {
        http::create_router(self.state.clone())
    }

    pub async fn http_get(&self, uri: &str, auth: Option<(&str, &str)>) -> (StatusCode, String) {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some((name, secret)) = auth {
            builder = builder.header(header::AUTHORIZATION, basic(name, secret));
        }
        let response = self
            .http()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }
}

pub fn basic(name: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{name}:{secret}")))
}

/// Checks that the git service binaries can run on this machine.
pub fn git_available() -> bool {
    Command::new("git-upload-pack")
        .arg("--help")
        .output()
        .is_ok_and(|o| !o.stdout.is_empty() || !o.stderr.is_empty())
}
