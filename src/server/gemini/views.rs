//! Gemtext rendering.

use chrono::{DateTime, Utc};

use crate::auth::Enrolment;
use crate::git::{CommitInfo, FileEntry, RefInfo, RefKind};
use crate::types::{AccessGrant, AccessSubject, Group, Member, Repo, Token, User};

struct Page(String);

impl Page {
    fn new(title: &str) -> Self {
        Self(format!("# {title}\n"))
    }

    fn heading(&mut self, text: &str) {
        self.0.push_str(&format!("\n## {text}\n"));
    }

    fn line(&mut self, text: &str) {
        self.0.push_str(text);
        self.0.push('\n');
    }

    fn item(&mut self, text: &str) {
        self.0.push_str(&format!("* {text}\n"));
    }

    fn link(&mut self, url: &str, label: &str) {
        self.0.push_str(&format!("=> {url} {label}\n"));
    }

    fn pre(&mut self, text: &str) {
        self.0.push_str("```\n");
        self.0.push_str(text);
        if !text.ends_with('\n') {
            self.0.push('\n');
        }
        self.0.push_str("```\n");
    }

    fn finish(self) -> String {
        self.0
    }
}

fn date(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d").to_string()
}

fn repo_url(repo: &Repo) -> String {
    format!("/repo/{}/{}", repo.owner_name, repo.name)
}

fn repo_label(repo: &Repo) -> String {
    let mut label = format!("{}/{}", repo.owner_name, repo.name);
    if !repo.description.is_empty() {
        label.push_str(&format!(" - {}", repo.description));
    }
    label
}

pub fn home(registration_open: bool, user: Option<&User>) -> String {
    let mut page = Page::new("gemforge");
    page.link("/repo", "Public repositories");
    match user {
        Some(user) => page.link("/account/", &format!("Account ({})", user.name)),
        None => {
            page.link("/login", "Log in");
            if registration_open {
                page.link("/register", "Register");
            }
        }
    }
    page.finish()
}

pub fn repo_list(title: &str, repos: &[Repo]) -> String {
    let mut page = Page::new(title);
    if repos.is_empty() {
        page.line("No repositories.");
    }
    for repo in repos {
        page.link(&repo_url(repo), &repo_label(repo));
    }
    page.finish()
}

pub fn repo_summary(repo: &Repo, clone_urls: &[String]) -> String {
    let base = repo_url(repo);
    let mut page = Page::new(&format!("{}/{}", repo.owner_name, repo.name));
    if !repo.description.is_empty() {
        page.line(&repo.description);
    }
    page.heading("Clone");
    for url in clone_urls {
        page.pre(&format!("git clone {url}"));
    }
    page.heading("Browse");
    page.link(&format!("{base}/files"), "Files");
    page.link(&format!("{base}/log"), "Log");
    page.link(&format!("{base}/refs"), "Refs");
    page.link(&format!("{base}/readme"), "Readme");
    page.link(&format!("{base}/license"), "License");
    page.link(&format!("/repo/{}", repo.owner_name), "Back");
    page.finish()
}

pub fn files(repo: &Repo, files: &[FileEntry]) -> String {
    let base = repo_url(repo);
    let mut page = Page::new(&format!("{}/{} files", repo.owner_name, repo.name));
    if files.is_empty() {
        page.line("Empty repository.");
    }
    for file in files {
        page.link(
            &format!("{base}/files/{}", file.oid),
            &format!("{} ({} bytes)", file.path, file.size),
        );
    }
    page.link(&base, "Back");
    page.finish()
}

pub fn log(repo: &Repo, commits: &[CommitInfo]) -> String {
    let mut page = Page::new(&format!("{}/{} log", repo.owner_name, repo.name));
    if commits.is_empty() {
        page.line("No commits.");
    }
    for commit in commits {
        let short = commit.id.get(..8).unwrap_or(&commit.id);
        page.item(&format!(
            "{} {short} {} ({})",
            date(commit.time),
            commit.summary,
            commit.author
        ));
    }
    page.link(&repo_url(repo), "Back");
    page.finish()
}

pub fn refs(repo: &Repo, refs: &[RefInfo]) -> String {
    let mut page = Page::new(&format!("{}/{} refs", repo.owner_name, repo.name));
    for (kind, title) in [(RefKind::Branch, "Branches"), (RefKind::Tag, "Tags")] {
        page.heading(title);
        for r in refs.iter().filter(|r| r.kind == kind) {
            let short = r.target.get(..8).unwrap_or(&r.target);
            page.item(&format!("{} {short}", r.name));
        }
    }
    page.link(&repo_url(repo), "Back");
    page.finish()
}

/// A file from the tree root. Gemtext is served as is, anything else
/// preformatted.
pub fn document(repo: &Repo, name: &str, content: &[u8]) -> String {
    let text = String::from_utf8_lossy(content);
    if name.ends_with(".gmi") {
        return text.into_owned();
    }
    let mut page = Page::new(name);
    page.pre(&text);
    page.link(&repo_url(repo), "Back");
    page.finish()
}

pub struct AccountView<'a> {
    pub base: &'a str,
    pub user: &'a User,
    pub repos: &'a [Repo],
    pub shared: &'a [Repo],
    pub groups: &'a [Group],
    pub local_password: bool,
}

pub fn account(view: &AccountView<'_>) -> String {
    let base = view.base;
    let user = view.user;
    let mut page = Page::new(&format!("Account {}", user.name));
    if !user.description.is_empty() {
        page.line(&user.description);
    }
    page.link(&format!("{base}chdesc"), "Change description");
    if view.local_password {
        page.link(&format!("{base}chpasswd"), "Change password");
    }
    page.link(&format!("{base}otp"), "Second factor");
    page.link(&format!("{base}token"), "Access tokens");

    page.heading("Repositories");
    page.link(&format!("{base}addrepo"), "Create a repository");
    for repo in view.repos {
        let visibility = if repo.public { "public" } else { "private" };
        page.link(
            &format!("{base}repo/{}", repo.name),
            &format!("{} ({visibility})", repo.name),
        );
    }

    page.heading("Shared with you");
    if view.shared.is_empty() {
        page.line("Nothing yet.");
    }
    for repo in view.shared {
        page.link(&repo_url(repo), &repo_label(repo));
    }

    page.heading("Groups");
    page.link(&format!("{base}addgroup"), "Create a group");
    for group in view.groups {
        page.link(&format!("{base}groups/{}", group.name), &group.name);
    }

    page.heading("Sessions");
    page.link(&format!("{base}disconnect-all"), "Disconnect other sessions");
    page.link(&format!("{base}disconnect"), "Disconnect");
    page.finish()
}

pub fn repo_admin(base: &str, repo: &Repo, grants: &[AccessGrant]) -> String {
    let admin = format!("{base}repo/{}", repo.name);
    let mut page = Page::new(&format!("{}/{}", repo.owner_name, repo.name));
    if !repo.description.is_empty() {
        page.line(&repo.description);
    }
    page.link(&repo_url(repo), "Browse");
    page.link(
        &format!("{admin}/togglepublic"),
        if repo.public { "Make private" } else { "Make public" },
    );
    page.link(
        &format!("{admin}/togglesecure"),
        if repo.secure_transfer {
            "Allow password transfers"
        } else {
            "Require tokens for transfers"
        },
    );
    page.link(&format!("{admin}/chname"), "Rename");
    page.link(&format!("{admin}/chdesc"), "Change description");
    page.link(&format!("{admin}/delrepo"), "Delete");

    page.heading("Access");
    page.link(&format!("{admin}/access/adduser"), "Add a user");
    page.link(&format!("{admin}/access/addgroup"), "Add a group");
    for grant in grants {
        let kind = match grant.subject {
            AccessSubject::User(_) => "user",
            AccessSubject::Group(_) => "group",
        };
        let target = format!("{admin}/access/{kind}/{}", grant.subject_name);
        page.item(&format!("{kind} {}: {}", grant.subject_name, grant.privilege));
        for action in ["none", "read", "write", "remove"] {
            page.link(&format!("{target}/{action}"), &format!("Set {action}"));
        }
    }
    page.link(base, "Back");
    page.finish()
}

pub fn group(base: &str, group: &Group, owner: Option<&User>, members: &[Member], is_owner: bool) -> String {
    let admin = format!("{base}groups/{}", group.name);
    let mut page = Page::new(&format!("Group {}", group.name));
    if !group.description.is_empty() {
        page.line(&group.description);
    }
    if let Some(owner) = owner {
        page.line(&format!("Owner: {}", owner.name));
    }

    page.heading("Members");
    for member in members {
        page.item(&member.user_name);
        if is_owner && member.user_id != group.owner_id {
            page.link(
                &format!("{admin}/rm/{}", member.user_name),
                &format!("Remove {}", member.user_name),
            );
        }
    }

    if is_owner {
        page.link(&format!("{admin}/add"), "Add a member");
        page.link(&format!("{admin}/desc"), "Change description");
        page.link(&format!("{admin}/delete"), "Delete group");
    } else {
        page.link(&format!("{admin}/leave"), "Leave group");
    }
    page.link(base, "Back");
    page.finish()
}

pub fn otp(base: &str, user: &User, pending: Option<&str>) -> String {
    let mut page = Page::new("Second factor");
    if user.has_otp() {
        page.line("Time-based one-time passwords are enabled.");
        page.link(&format!("{base}otp/remove"), "Disable");
    } else if let Some(secret) = pending {
        page.line("Enrolment pending for secret:");
        page.pre(secret);
        page.link(&format!("{base}otp/confirm"), "Confirm with a code");
        page.link(&format!("{base}otp/enroll"), "Start over");
    } else {
        page.line("Time-based one-time passwords are disabled.");
        page.link(&format!("{base}otp/enroll"), "Enable");
    }
    page.link(base, "Back");
    page.finish()
}

pub fn otp_enrolment(base: &str, enrolment: &Enrolment) -> String {
    let mut page = Page::new("Enable second factor");
    page.line("Add this account to your authenticator, then confirm with a code.");
    page.pre(&enrolment.url);
    page.line("Secret for manual entry:");
    page.pre(&enrolment.secret);
    page.link(&format!("{base}otp/confirm"), "Confirm");
    page.link(base, "Back");
    page.finish()
}

pub fn tokens(base: &str, user: &User, tokens: &[Token], now: DateTime<Utc>) -> String {
    let mut page = Page::new("Access tokens");
    page.line(if user.secure_transfer {
        "Transfers require a token."
    } else {
        "Transfers accept your password or a token."
    });
    page.link(&format!("{base}token/toggle-secure"), "Toggle secure transfers");
    page.link(&format!("{base}token/new-read"), "New read-only token");
    page.link(&format!("{base}token/new-write"), "New read-write token");

    page.heading("Tokens");
    for token in tokens {
        let scope = if token.read_only { "read" } else { "read-write" };
        let state = if token.is_expired(now) { "expired" } else { "expires" };
        page.item(&format!(
            "{}... {scope}, {state} {}",
            token.hint,
            date(token.expires_at)
        ));
        page.link(&format!("{base}token/renew/{}", token.id), "Renew");
        page.link(&format!("{base}token/delete/{}", token.id), "Delete");
    }
    page.link(base, "Back");
    page.finish()
}

pub fn token_created(base: &str, plaintext: &str, token: &Token) -> String {
    let mut page = Page::new("Token created");
    page.line("Copy it now, it will not be shown again.");
    page.pre(plaintext);
    page.line(&format!("Expires {}.", date(token.expires_at)));
    page.link(&format!("{base}token"), "Back");
    page.finish()
}
