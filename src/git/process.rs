use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::ReceivePack)
    }
}

/// Runs one stateless-rpc round for smart HTTP.
pub async fn run_stateless(
    repo_path: &Path,
    service: GitService,
    advertise_refs: bool,
    input: Option<&[u8]>,
) -> Result<Output> {
    let mut cmd = Command::new(service.command_name());
    cmd.arg("--stateless-rpc");

    if advertise_refs {
        cmd.arg("--advertise-refs");
    }

    cmd.arg(repo_path);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(data) = input {
            stdin.write_all(data).await?;
        }
    }

    let output = tokio::time::timeout(GIT_COMMAND_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "git command timed out",
            ))
        })??;

    Ok(output)
}

/// Starts a long-lived service process for an SSH channel. The caller owns
/// the piped stdio.
pub fn spawn_service(repo_path: &Path, service: GitService) -> Result<Child> {
    let child = Command::new(service.command_name())
        .arg(repo_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

pub fn format_pkt_line_header(service: GitService) -> Vec<u8> {
    let service_name = service.command_name();
    let service_line = format!("# service={service_name}\n");
    let length = service_line.len() + 4;
    let mut result = format!("{length:04x}{service_line}").into_bytes();
    result.extend_from_slice(b"0000");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_service_from_name() {
        assert_eq!(
            GitService::from_name("git-upload-pack"),
            Some(GitService::UploadPack)
        );
        assert_eq!(
            GitService::from_name("git-receive-pack"),
            Some(GitService::ReceivePack)
        );
        assert_eq!(GitService::from_name("git-upload-archive"), None);
    }

    #[test]
    fn test_format_pkt_line_header() {
        let header = format_pkt_line_header(GitService::UploadPack);
        let header_str = String::from_utf8_lossy(&header);
        assert!(header_str.starts_with("001e# service=git-upload-pack\n"));
        assert!(header_str.ends_with("0000"));
    }
}
