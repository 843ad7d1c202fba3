//! SSH transfer gateway. Accepts password, keyboard-interactive and, for the
//! `anon` user, no authentication at all. Credentials are only captured
//! during the handshake; they are checked against the repository named by
//! the exec request, because whether a password is acceptable depends on it.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Response, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;

use super::AppState;
use super::transfer::{Credentials, authorize};
use crate::git::{GitService, spawn_service};
use crate::validation::ANONYMOUS_USER;

const STDERR: u32 = 1;
const CHUNK_SIZE: usize = 32 * 1024;

/// Splits `git-upload-pack '/owner/repo.git'` into its parts.
pub fn parse_command(command: &str) -> Option<(GitService, String, String)> {
    let (program, argument) = command.trim().split_once(' ')?;
    let service = GitService::from_name(program)?;

    let path = argument.trim().trim_matches('\'').trim_matches('"');
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((service, owner.to_string(), repo.to_string()))
}

#[derive(Clone)]
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshSession {
        SshSession {
            state: self.state.clone(),
            peer: peer
                .map(|p| p.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            credentials: None,
            stdin: HashMap::new(),
        }
    }
}

pub struct SshSession {
    state: Arc<AppState>,
    peer: IpAddr,
    credentials: Option<Credentials>,
    stdin: HashMap<ChannelId, ChildStdin>,
}

impl SshSession {
    fn accept(&mut self, name: &str, secret: &str) -> Auth {
        self.credentials = Some(credentials_for(name, secret));
        Auth::Accept
    }

    async fn fail(handle: &Handle, channel: ChannelId, message: &str) {
        let line = CryptoVec::from_slice(format!("{message}\n").as_bytes());
        let _ = handle.extended_data(channel, STDERR, line).await;
        finish(handle, channel, 1).await;
    }
}

/// Whatever was typed as a password, `anon` stays anonymous.
fn credentials_for(name: &str, secret: &str) -> Credentials {
    if name == ANONYMOUS_USER {
        return Credentials::Anonymous;
    }
    Credentials::Secret {
        name: name.to_string(),
        secret: secret.to_string(),
    }
}

async fn finish(handle: &Handle, channel: ChannelId, code: u32) {
    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

async fn pump<R: AsyncRead + Unpin>(
    handle: &Handle,
    channel: ChannelId,
    mut reader: R,
    extended: Option<u32>,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match extended {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        if sent.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if user == ANONYMOUS_USER {
            return Ok(self.accept(user, ""));
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD | MethodSet::KEYBOARD_INTERACTIVE),
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept(user, password))
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'async_trait>>,
    ) -> Result<Auth, Self::Error> {
        let Some(mut response) = response else {
            return Ok(Auth::Partial {
                name: Cow::Borrowed(""),
                instructions: Cow::Borrowed(""),
                prompts: Cow::Owned(vec![(Cow::Borrowed("Password: "), false)]),
            });
        };
        let secret = response
            .next()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        Ok(self.accept(user, &secret))
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        let handle = session.handle();
        let command = String::from_utf8_lossy(data);

        let Some((service, owner, repo)) = parse_command(&command) else {
            tracing::warn!(peer = %self.peer, %command, "Rejected SSH command");
            Self::fail(&handle, channel, "unsupported command").await;
            return Ok(());
        };

        let credentials = self.credentials.clone().unwrap_or(Credentials::Anonymous);
        let authorized =
            match authorize(&self.state, &owner, &repo, service, credentials, self.peer).await {
                Ok(a) => a,
                Err(e) => {
                    Self::fail(&handle, channel, &e.message()).await;
                    return Ok(());
                }
            };

        let mut child = match spawn_service(&authorized.path, service) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to start {}: {e}", service.command_name());
                Self::fail(&handle, channel, "unexpected error").await;
                return Ok(());
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            Self::fail(&handle, channel, "unexpected error").await;
            return Ok(());
        };
        self.stdin.insert(channel, stdin);

        tracing::info!(
            user = authorized.user.as_ref().map(|u| u.name.as_str()),
            owner = %authorized.repo.owner_name,
            repo = %authorized.repo.name,
            service = service.command_name(),
            "SSH transfer started"
        );

        tokio::spawn(async move {
            tokio::join!(
                pump(&handle, channel, stdout, None),
                pump(&handle, channel, stderr, Some(STDERR)),
            );
            let code = match child.wait().await {
                Ok(status) => status.code().map_or(1, |c| c as u32),
                Err(_) => 1,
            };
            finish(&handle, channel, code).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdin.get_mut(&channel) {
            if stdin.write_all(data).await.is_err() {
                self.stdin.remove(&channel);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the pipe delivers EOF to the git process.
        self.stdin.remove(&channel);
        Ok(())
    }
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let remote = &state.config.git.remote;
    let key = russh_keys::load_secret_key(&remote.secret, None)
        .with_context(|| format!("cannot load SSH host key {}", remote.secret.display()))?;
    let addr = remote.socket_addr()?;

    let config = russh::server::Config {
        keys: vec![key],
        methods: MethodSet::NONE | MethodSet::PASSWORD | MethodSet::KEYBOARD_INTERACTIVE,
        auth_rejection_time: Duration::from_secs(1),
        inactivity_timeout: Some(Duration::from_secs(600)),
        ..Default::default()
    };

    tracing::info!("SSH listening on {addr}");
    let mut server = SshServer::new(state);
    server.run_on_address(Arc::new(config), addr).await?;
    Ok(())
}
