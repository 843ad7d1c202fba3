pub const SCHEMA: &str = r#"
-- Accounts; password is NULL when the directory service authenticates the user
CREATE TABLE IF NOT EXISTS user (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    password TEXT,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    secret TEXT NOT NULL DEFAULT ''   -- base32 TOTP secret, empty = no second factor
);

CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    owner_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS member (
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    PRIMARY KEY (group_id, user_id)
);

CREATE TABLE IF NOT EXISTS repo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    public INTEGER NOT NULL DEFAULT 0
);

-- Exactly one of user_id / group_id is set
CREATE TABLE IF NOT EXISTS access (
    repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
    user_id INTEGER REFERENCES user(id) ON DELETE CASCADE,
    group_id INTEGER REFERENCES groups(id) ON DELETE CASCADE,
    privilege INTEGER NOT NULL DEFAULT 1,
    CHECK ((user_id IS NULL) <> (group_id IS NULL)),
    CHECK (privilege BETWEEN 0 AND 2)
);

-- Gemini sessions keyed by client certificate fingerprint
CREATE TABLE IF NOT EXISTS certificate (
    hash TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    created_at INTEGER NOT NULL       -- unix seconds
);

CREATE TABLE IF NOT EXISTS token (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    hash TEXT NOT NULL,               -- base64 SHA-224 of the raw token bytes
    hint TEXT NOT NULL,
    expires_at INTEGER NOT NULL,      -- unix seconds
    read_only INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_user_name ON user(name COLLATE NOCASE);
CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_name ON groups(name COLLATE NOCASE);
CREATE UNIQUE INDEX IF NOT EXISTS idx_repo_owner_name ON repo(owner_id, name COLLATE NOCASE);
CREATE UNIQUE INDEX IF NOT EXISTS idx_access_user ON access(repo_id, user_id) WHERE user_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_access_group ON access(repo_id, group_id) WHERE group_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_token_hash ON token(hash);
CREATE INDEX IF NOT EXISTS idx_token_user ON token(user_id);
CREATE INDEX IF NOT EXISTS idx_certificate_user ON certificate(user_id);
CREATE INDEX IF NOT EXISTS idx_member_user ON member(user_id);
"#;

/// Columns added after the first schema; applied when missing so legacy
/// databases upgrade in place.
pub const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("user", "secure_transfer", "INTEGER NOT NULL DEFAULT 0"),
    ("repo", "secure_transfer", "INTEGER NOT NULL DEFAULT 0"),
    ("certificate", "pending_otp", "INTEGER NOT NULL DEFAULT 0"),
];
