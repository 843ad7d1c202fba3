use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use git2::{ObjectType, Oid, Repository, RepositoryInitOptions, TreeWalkMode, TreeWalkResult};

use crate::error::{Error, Result};

const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub oid: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub author: String,
    pub summary: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefInfo {
    pub name: String,
    pub kind: RefKind,
    pub target: String,
}

/// The bare repository tree, laid out as `<root>/<owner>/<repo>`.
#[derive(Debug, Clone)]
pub struct RepoStorage {
    root: PathBuf,
}

impl RepoStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn repo_path(&self, owner: &str, repo: &str) -> PathBuf {
        self.root.join(owner).join(repo)
    }

    pub fn init(&self, owner: &str, repo: &str) -> Result<()> {
        let path = self.repo_path(owner, repo);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut opts = RepositoryInitOptions::new();
        opts.bare(true).initial_head(DEFAULT_BRANCH);
        Repository::init_opts(&path, &opts)?;
        tracing::info!("Initialized bare repository at {}", path.display());
        Ok(())
    }

    pub fn rename(&self, owner: &str, old: &str, new: &str) -> Result<()> {
        let from = self.repo_path(owner, old);
        if !from.exists() {
            return Ok(());
        }
        std::fs::rename(from, self.repo_path(owner, new))?;
        Ok(())
    }

    pub fn remove(&self, owner: &str, repo: &str) -> Result<()> {
        remove_dir_if_exists(&self.repo_path(owner, repo))
    }

    /// Removes every repository of an owner.
    pub fn remove_owner(&self, owner: &str) -> Result<()> {
        remove_dir_if_exists(&self.root.join(owner))
    }

    pub fn open(&self, owner: &str, repo: &str) -> Result<Repository> {
        Repository::open_bare(self.repo_path(owner, repo)).map_err(Error::from)
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn head_tree(repo: &Repository) -> Result<Option<git2::Tree<'_>>> {
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if matches!(e.code(), git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound) => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Some(head.peel_to_tree()?))
}

/// Every blob reachable from HEAD, in tree order. Empty for a repository
/// without commits.
pub fn list_files(repo: &Repository) -> Result<Vec<FileEntry>> {
    let Some(tree) = head_tree(repo)? else {
        return Ok(Vec::new());
    };

    let mut files = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            let size = repo
                .find_blob(entry.id())
                .map(|b| b.size())
                .unwrap_or_default();
            files.push(FileEntry {
                path: format!("{dir}{}", entry.name().unwrap_or("")),
                oid: entry.id().to_string(),
                size,
            });
        }
        TreeWalkResult::Ok
    })?;
    Ok(files)
}

pub fn log(repo: &Repository, limit: usize) -> Result<Vec<CommitInfo>> {
    if head_tree(repo)?.is_none() {
        return Ok(Vec::new());
    }

    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    walk.set_sorting(git2::Sort::TIME)?;

    let mut commits = Vec::new();
    for oid in walk.take(limit) {
        let commit = repo.find_commit(oid?)?;
        let author = commit.author();
        commits.push(CommitInfo {
            id: commit.id().to_string(),
            author: author.name().unwrap_or("").to_string(),
            summary: commit.summary().unwrap_or("").to_string(),
            time: Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_else(Utc::now),
        });
    }
    Ok(commits)
}

pub fn refs(repo: &Repository) -> Result<Vec<RefInfo>> {
    let mut refs = Vec::new();
    for reference in repo.references()? {
        let reference = reference?;
        let Some(full) = reference.name() else {
            continue;
        };
        let (kind, name) = if let Some(name) = full.strip_prefix("refs/heads/") {
            (RefKind::Branch, name)
        } else if let Some(name) = full.strip_prefix("refs/tags/") {
            (RefKind::Tag, name)
        } else {
            continue;
        };
        let target = reference.peel_to_commit().map(|c| c.id().to_string())?;
        refs.push(RefInfo {
            name: name.to_string(),
            kind,
            target,
        });
    }
    refs.sort_by(|a, b| (a.kind as u8, &a.name).cmp(&(b.kind as u8, &b.name)));
    Ok(refs)
}

/// First file at the tree root whose name starts with `prefix`, ignoring case.
pub fn find_root_file(repo: &Repository, prefix: &str) -> Result<Option<(String, Vec<u8>)>> {
    let Some(tree) = head_tree(repo)? else {
        return Ok(None);
    };
    let prefix = prefix.to_lowercase();

    for entry in tree.iter() {
        let Some(name) = entry.name() else { continue };
        if entry.kind() == Some(ObjectType::Blob) && name.to_lowercase().starts_with(&prefix) {
            let blob = repo.find_blob(entry.id())?;
            return Ok(Some((name.to_string(), blob.content().to_vec())));
        }
    }
    Ok(None)
}

/// Blob content by hash; `None` for unknown or non-blob objects.
pub fn blob(repo: &Repository, hash: &str) -> Result<Option<Vec<u8>>> {
    let Ok(oid) = Oid::from_str(hash) else {
        return Ok(None);
    };
    match repo.find_blob(oid) {
        Ok(blob) => Ok(Some(blob.content().to_vec())),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) if e.class() == git2::ErrorClass::Invalid => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[must_use]
pub fn is_binary(content: &[u8]) -> bool {
    let sample_size = content.len().min(8192);
    content[..sample_size].contains(&0)
}
