use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use super::Store;
use super::schema::{ADDED_COLUMNS, SCHEMA};
use crate::error::{Contributor, Error, Result};
use crate::types::*;
use crate::validation::{validate_group_name, validate_repo_name, validate_user_name};

const USER_SELECT: &str = "SELECT u.id, u.name, u.password, u.description, u.created_at, u.secret, u.secure_transfer
     FROM user u";

const REPO_SELECT: &str = "SELECT r.id, r.owner_id, u.name, r.name, r.description, r.created_at, r.public, r.secure_transfer
     FROM repo r JOIN user u ON u.id = r.owner_id";

const GROUP_SELECT: &str = "SELECT g.id, g.name, g.owner_id, g.description, g.created_at FROM groups g";

const TOKEN_SELECT: &str =
    "SELECT t.id, t.user_id, t.hash, t.hint, t.expires_at, t.read_only FROM token t";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and tooling.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the connection for statements outside the `Store` trait.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let secret: String = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        password_hash: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        totp_secret: (!secret.is_empty()).then_some(secret),
        secure_transfer: row.get(6)?,
    })
}

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repo> {
    Ok(Repo {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_name: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        public: row.get(6)?,
        secure_transfer: row.get(7)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        user_id: row.get(1)?,
        hash: row.get(2)?,
        hint: row.get(3)?,
        expires_at: from_unix(row.get(4)?),
        read_only: row.get(5)?,
    })
}

fn privilege_from_level(level: i64) -> Privilege {
    Privilege::try_from(level).unwrap_or_else(|other| {
        tracing::error!("Invalid privilege level in database: {other}");
        Privilege::None
    })
}

fn find_user_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM user WHERE name = ?1 COLLATE NOCASE",
        params![name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(Error::UserNotFound)
}

fn find_group_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM groups WHERE name = ?1 COLLATE NOCASE",
        params![name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(Error::GroupNotFound)
}

/// Returns the repo owner after checking it is `user_id`.
fn check_repo_owner(conn: &Connection, user_id: i64, repo_id: i64, action: &'static str) -> Result<i64> {
    let owner_id: i64 = conn
        .query_row(
            "SELECT owner_id FROM repo WHERE id = ?1",
            params![repo_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::RepoNotFound)?;

    if owner_id != user_id {
        return Err(Error::NotRepoOwner(action));
    }
    Ok(owner_id)
}

fn group_owner(conn: &Connection, group_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT owner_id FROM groups WHERE id = ?1",
        params![group_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(Error::GroupNotFound)
}

fn check_group_owner(conn: &Connection, user_id: i64, group_id: i64, action: &'static str) -> Result<()> {
    if group_owner(conn, group_id)? != user_id {
        return Err(Error::NotGroupOwner(action));
    }
    Ok(())
}

fn add_missing_columns(conn: &Connection) -> Result<()> {
    for (table, column, definition) in ADDED_COLUMNS {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if !columns.iter().any(|c| c == column) {
            tracing::info!("Migrating table {table}: adding column {column}");
            conn.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {column} {definition}"
            ))?;
        }
    }
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        add_missing_columns(&conn)?;
        Ok(())
    }

    // User operations

    fn create_user(&self, name: &str, password_hash: Option<&str>) -> Result<User> {
        validate_user_name(name)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM user WHERE name = ?1 COLLATE NOCASE",
                params![name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(Error::NameTaken);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO user (name, password, description, created_at, secret, secure_transfer)
             VALUES (?1, ?2, '', ?3, '', 0)",
            params![name, password_hash, format_datetime(&now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(User {
            id,
            name: name.to_string(),
            password_hash: password_hash.map(str::to_string),
            description: String::new(),
            created_at: now,
            totp_secret: None,
            secure_transfer: false,
        })
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("{USER_SELECT} WHERE u.id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("{USER_SELECT} WHERE u.name = ?1 COLLATE NOCASE"),
            params![name],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{USER_SELECT} ORDER BY u.name COLLATE NOCASE"))?;
        let rows = stmt.query_map([], user_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_user(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM user WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn update_password(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE user SET password = ?1 WHERE id = ?2",
            params![password_hash, user_id],
        )?;
        if rows == 0 {
            return Err(Error::UserNotFound);
        }
        Ok(())
    }

    fn update_user_description(&self, user_id: i64, description: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE user SET description = ?1 WHERE id = ?2",
            params![description, user_id],
        )?;
        if rows == 0 {
            return Err(Error::UserNotFound);
        }
        Ok(())
    }

    fn set_totp_secret(&self, user_id: i64, secret: Option<&str>) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE user SET secret = ?1 WHERE id = ?2",
            params![secret.unwrap_or(""), user_id],
        )?;
        if rows == 0 {
            return Err(Error::UserNotFound);
        }
        Ok(())
    }

    fn set_user_secure_transfer(&self, user_id: i64, enabled: bool) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE user SET secure_transfer = ?1 WHERE id = ?2",
            params![enabled, user_id],
        )?;
        if rows == 0 {
            return Err(Error::UserNotFound);
        }
        Ok(())
    }

    // Repo operations

    fn create_repo(&self, owner_id: i64, name: &str, description: &str) -> Result<Repo> {
        validate_repo_name(name)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let owner_name: String = tx
            .query_row(
                "SELECT name FROM user WHERE id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::UserNotFound)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM repo WHERE owner_id = ?1 AND name = ?2 COLLATE NOCASE",
                params![owner_id, name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(Error::NameTaken);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO repo (owner_id, name, description, created_at, public, secure_transfer)
             VALUES (?1, ?2, ?3, ?4, 0, 0)",
            params![owner_id, name, description, format_datetime(&now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Repo {
            id,
            owner_id,
            owner_name,
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            public: false,
            secure_transfer: false,
        })
    }

    fn get_repo(&self, owner_name: &str, name: &str) -> Result<Option<Repo>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "{REPO_SELECT} WHERE u.name = ?1 COLLATE NOCASE AND r.name = ?2 COLLATE NOCASE"
            ),
            params![owner_name, name],
            repo_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_repo_by_id(&self, id: i64) -> Result<Option<Repo>> {
        let conn = self.conn();
        conn.query_row(
            &format!("{REPO_SELECT} WHERE r.id = ?1"),
            params![id],
            repo_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_user_repos(&self, owner_id: i64, only_public: bool) -> Result<Vec<Repo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{REPO_SELECT} WHERE r.owner_id = ?1 AND (r.public = 1 OR ?2 = 0)
             ORDER BY r.name COLLATE NOCASE"
        ))?;
        let rows = stmt.query_map(params![owner_id, only_public], repo_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_public_repos(&self) -> Result<Vec<Repo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{REPO_SELECT} WHERE r.public = 1 ORDER BY u.name COLLATE NOCASE, r.name COLLATE NOCASE"
        ))?;
        let rows = stmt.query_map([], repo_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn rename_repo(&self, user_id: i64, repo_id: i64, new_name: &str) -> Result<()> {
        validate_repo_name(new_name)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "rename it")?;

        let taken = tx
            .query_row(
                "SELECT 1 FROM repo WHERE owner_id = ?1 AND name = ?2 COLLATE NOCASE AND id != ?3",
                params![user_id, new_name, repo_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if taken {
            return Err(Error::NameTaken);
        }

        tx.execute(
            "UPDATE repo SET name = ?1 WHERE id = ?2",
            params![new_name, repo_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_repo_description(&self, user_id: i64, repo_id: i64, description: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "change its description")?;
        tx.execute(
            "UPDATE repo SET description = ?1 WHERE id = ?2",
            params![description, repo_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn toggle_repo_public(&self, user_id: i64, repo_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "change its visibility")?;
        tx.execute(
            "UPDATE repo SET public = NOT public WHERE id = ?1",
            params![repo_id],
        )?;
        let public: bool = tx.query_row(
            "SELECT public FROM repo WHERE id = ?1",
            params![repo_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(public)
    }

    fn toggle_repo_secure_transfer(&self, user_id: i64, repo_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "change its transfer mode")?;
        tx.execute(
            "UPDATE repo SET secure_transfer = NOT secure_transfer WHERE id = ?1",
            params![repo_id],
        )?;
        let secure: bool = tx.query_row(
            "SELECT secure_transfer FROM repo WHERE id = ?1",
            params![repo_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(secure)
    }

    fn delete_repo(&self, user_id: i64, repo_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "delete it")?;
        tx.execute("DELETE FROM repo WHERE id = ?1", params![repo_id])?;
        tx.commit()?;
        Ok(())
    }

    fn repos_with_read_access(&self, user_id: i64) -> Result<Vec<Repo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{REPO_SELECT}
             WHERE r.owner_id != ?1 AND (
                 r.id IN (SELECT a.repo_id FROM access a
                          WHERE a.user_id = ?1 AND a.privilege >= 1)
                 OR r.id IN (SELECT a.repo_id FROM access a
                             JOIN member m ON m.group_id = a.group_id
                             WHERE m.user_id = ?1 AND a.privilege >= 1)
             )
             ORDER BY u.name COLLATE NOCASE, r.name COLLATE NOCASE"
        ))?;
        let rows = stmt.query_map(params![user_id], repo_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Group operations

    fn create_group(&self, owner_id: i64, name: &str, description: &str) -> Result<Group> {
        validate_group_name(name)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM groups WHERE name = ?1 COLLATE NOCASE",
                params![name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(Error::NameTaken);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO groups (name, owner_id, description, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, owner_id, description, format_datetime(&now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO member (group_id, user_id) VALUES (?1, ?2)",
            params![id, owner_id],
        )?;
        tx.commit()?;

        Ok(Group {
            id,
            name: name.to_string(),
            owner_id,
            description: description.to_string(),
            created_at: now,
        })
    }

    fn get_group(&self, name: &str) -> Result<Option<Group>> {
        let conn = self.conn();
        conn.query_row(
            &format!("{GROUP_SELECT} WHERE g.name = ?1 COLLATE NOCASE"),
            params![name],
            group_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn delete_group(&self, user_id: i64, group_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_group_owner(&tx, user_id, group_id, "delete the group")?;
        tx.execute("DELETE FROM groups WHERE id = ?1", params![group_id])?;
        tx.commit()?;
        Ok(())
    }

    fn set_group_description(&self, user_id: i64, group_id: i64, description: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_group_owner(&tx, user_id, group_id, "change the description")?;
        tx.execute(
            "UPDATE groups SET description = ?1 WHERE id = ?2",
            params![description, group_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn add_group_member(&self, user_id: i64, group_id: i64, member_name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_group_owner(&tx, user_id, group_id, "add members")?;
        let member_id = find_user_id(&tx, member_name)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM member WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, member_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(Error::AlreadyMember);
        }

        tx.execute(
            "INSERT INTO member (group_id, user_id) VALUES (?1, ?2)",
            params![group_id, member_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove_group_member(&self, user_id: i64, group_id: i64, member_name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let owner_id = group_owner(&tx, group_id)?;
        let member_id = find_user_id(&tx, member_name)?;

        if user_id != owner_id && user_id != member_id {
            return Err(Error::NotGroupOwner("remove other members"));
        }
        if member_id == owner_id {
            return Err(Error::OwnerCannotLeave);
        }

        let rows = tx.execute(
            "DELETE FROM member WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, member_id],
        )?;
        if rows == 0 {
            return Err(Error::NotMember);
        }
        tx.commit()?;
        Ok(())
    }

    fn list_group_members(&self, group_id: i64) -> Result<Vec<Member>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.group_id, m.user_id, u.name FROM member m
             JOIN user u ON u.id = m.user_id
             WHERE m.group_id = ?1 ORDER BY u.name COLLATE NOCASE",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(Member {
                group_id: row.get(0)?,
                user_id: row.get(1)?,
                user_name: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_group_owner(&self, group_id: i64) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("{USER_SELECT} JOIN groups g ON g.owner_id = u.id WHERE g.id = ?1"),
            params![group_id],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_user_groups(&self, user_id: i64) -> Result<Vec<Group>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{GROUP_SELECT} JOIN member m ON m.group_id = g.id
             WHERE m.user_id = ?1 ORDER BY g.name COLLATE NOCASE"
        ))?;
        let rows = stmt.query_map(params![user_id], group_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Access grant operations

    fn add_user_access(&self, user_id: i64, repo_id: i64, target_name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let owner_id = check_repo_owner(&tx, user_id, repo_id, "manage its contributors")?;
        let target_id = find_user_id(&tx, target_name)?;
        if target_id == owner_id {
            return Err(Error::OwnerAsContributor);
        }

        let exists = tx
            .query_row(
                "SELECT 1 FROM access WHERE repo_id = ?1 AND user_id = ?2",
                params![repo_id, target_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(Error::AlreadyContributor(Contributor::User));
        }

        tx.execute(
            "INSERT INTO access (repo_id, user_id, privilege) VALUES (?1, ?2, 1)",
            params![repo_id, target_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn add_group_access(&self, user_id: i64, repo_id: i64, group_name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "manage its contributors")?;
        let group_id = find_group_id(&tx, group_name)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM access WHERE repo_id = ?1 AND group_id = ?2",
                params![repo_id, group_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(Error::AlreadyContributor(Contributor::Group));
        }

        tx.execute(
            "INSERT INTO access (repo_id, group_id, privilege) VALUES (?1, ?2, 1)",
            params![repo_id, group_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_user_access(
        &self,
        user_id: i64,
        repo_id: i64,
        target_name: &str,
        privilege: Privilege,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "manage its contributors")?;
        let target_id = find_user_id(&tx, target_name)?;

        let rows = tx.execute(
            "UPDATE access SET privilege = ?1 WHERE repo_id = ?2 AND user_id = ?3",
            params![privilege.level(), repo_id, target_id],
        )?;
        if rows == 0 {
            return Err(Error::NotContributor(Contributor::User));
        }
        tx.commit()?;
        Ok(())
    }

    fn set_group_access(
        &self,
        user_id: i64,
        repo_id: i64,
        group_name: &str,
        privilege: Privilege,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "manage its contributors")?;
        let group_id = find_group_id(&tx, group_name)?;

        let rows = tx.execute(
            "UPDATE access SET privilege = ?1 WHERE repo_id = ?2 AND group_id = ?3",
            params![privilege.level(), repo_id, group_id],
        )?;
        if rows == 0 {
            return Err(Error::NotContributor(Contributor::Group));
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_user_access(&self, user_id: i64, repo_id: i64, target_name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "manage its contributors")?;
        let target_id = find_user_id(&tx, target_name)?;

        let rows = tx.execute(
            "DELETE FROM access WHERE repo_id = ?1 AND user_id = ?2",
            params![repo_id, target_id],
        )?;
        if rows == 0 {
            return Err(Error::NotContributor(Contributor::User));
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_group_access(&self, user_id: i64, repo_id: i64, group_name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_repo_owner(&tx, user_id, repo_id, "manage its contributors")?;
        let group_id = find_group_id(&tx, group_name)?;

        let rows = tx.execute(
            "DELETE FROM access WHERE repo_id = ?1 AND group_id = ?2",
            params![repo_id, group_id],
        )?;
        if rows == 0 {
            return Err(Error::NotContributor(Contributor::Group));
        }
        tx.commit()?;
        Ok(())
    }

    fn list_repo_access(&self, repo_id: i64) -> Result<Vec<AccessGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.repo_id, a.user_id, a.group_id, COALESCE(u.name, g.name), a.privilege
             FROM access a
             LEFT JOIN user u ON u.id = a.user_id
             LEFT JOIN groups g ON g.id = a.group_id
             WHERE a.repo_id = ?1
             ORDER BY a.group_id IS NOT NULL, COALESCE(u.name, g.name) COLLATE NOCASE",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| {
            let user_id: Option<i64> = row.get(1)?;
            let group_id: Option<i64> = row.get(2)?;
            let subject = match (user_id, group_id) {
                (Some(id), _) => AccessSubject::User(id),
                (None, Some(id)) => AccessSubject::Group(id),
                (None, None) => AccessSubject::User(0),
            };
            Ok(AccessGrant {
                repo_id: row.get(0)?,
                subject,
                subject_name: row.get(3)?,
                privilege: privilege_from_level(row.get(4)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_user_access(&self, repo_id: i64, user_id: i64) -> Result<Option<Privilege>> {
        let conn = self.conn();
        let level: Option<i64> = conn
            .query_row(
                "SELECT privilege FROM access WHERE repo_id = ?1 AND user_id = ?2",
                params![repo_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(level.map(privilege_from_level))
    }

    fn get_group_access_for_user(&self, repo_id: i64, user_id: i64) -> Result<Option<Privilege>> {
        let conn = self.conn();
        let level: Option<i64> = conn.query_row(
            "SELECT MAX(a.privilege) FROM access a
             JOIN member m ON m.group_id = a.group_id
             WHERE a.repo_id = ?1 AND m.user_id = ?2",
            params![repo_id, user_id],
            |row| row.get(0),
        )?;
        Ok(level.map(privilege_from_level))
    }

    // Session operations

    fn create_session(&self, fingerprint: &str, user_id: i64, pending_otp: bool) -> Result<Session> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO certificate (hash, user_id, created_at, pending_otp) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (hash) DO UPDATE SET
                user_id = excluded.user_id,
                created_at = excluded.created_at,
                pending_otp = excluded.pending_otp",
            params![fingerprint, user_id, now.timestamp(), pending_otp],
        )?;
        Ok(Session {
            fingerprint: fingerprint.to_string(),
            user_id,
            created_at: from_unix(now.timestamp()),
            pending_otp,
        })
    }

    fn get_session(&self, fingerprint: &str) -> Result<Option<(Session, User)>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT u.id, u.name, u.password, u.description, u.created_at, u.secret, u.secure_transfer,
                    c.hash, c.created_at, c.pending_otp
             FROM certificate c JOIN user u ON u.id = c.user_id
             WHERE c.hash = ?1",
            params![fingerprint],
            |row| {
                let user = user_from_row(row)?;
                let session = Session {
                    fingerprint: row.get(7)?,
                    user_id: user.id,
                    created_at: from_unix(row.get(8)?),
                    pending_otp: row.get(9)?,
                };
                Ok((session, user))
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn confirm_session(&self, fingerprint: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE certificate SET pending_otp = 0 WHERE hash = ?1",
            params![fingerprint],
        )?;
        Ok(rows > 0)
    }

    fn delete_session(&self, fingerprint: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM certificate WHERE hash = ?1", params![fingerprint])?;
        Ok(rows > 0)
    }

    fn delete_user_sessions(&self, user_id: i64, keep: Option<&str>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM certificate WHERE user_id = ?1 AND (?2 IS NULL OR hash != ?2)",
            params![user_id, keep],
        )?;
        Ok(rows)
    }

    fn delete_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM certificate WHERE created_at < ?1",
            params![cutoff.timestamp()],
        )?;
        Ok(rows)
    }

    // Token operations

    fn create_token(&self, token: &NewToken) -> Result<Token> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = tx.execute(
            "INSERT INTO token (user_id, hash, hint, expires_at, read_only)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.user_id,
                token.hash,
                token.hint,
                token.expires_at.timestamp(),
                token.read_only,
            ],
        );

        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Err(Error::TokenHashCollision),
            Err(e) => return Err(Error::from(e)),
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Token {
            id,
            user_id: token.user_id,
            hash: token.hash.clone(),
            hint: token.hint.clone(),
            expires_at: from_unix(token.expires_at.timestamp()),
            read_only: token.read_only,
        })
    }

    fn list_user_tokens(&self, user_id: i64) -> Result<Vec<Token>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{TOKEN_SELECT} WHERE t.user_id = ?1 ORDER BY t.id"
        ))?;
        let rows = stmt.query_map(params![user_id], token_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_token_for_user(&self, user_name: &str, hash: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "{TOKEN_SELECT} JOIN user u ON u.id = t.user_id
                 WHERE u.name = ?1 COLLATE NOCASE AND t.hash = ?2"
            ),
            params![user_name, hash],
            token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn set_token_expiry(&self, user_id: i64, token_id: i64, expires_at: DateTime<Utc>) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE token SET expires_at = ?1 WHERE id = ?2 AND user_id = ?3",
            params![expires_at.timestamp(), token_id, user_id],
        )?;
        if rows == 0 {
            return Err(Error::InvalidToken);
        }
        Ok(())
    }

    fn delete_token(&self, user_id: i64, token_id: i64) -> Result<()> {
        let rows = self.conn().execute(
            "DELETE FROM token WHERE id = ?1 AND user_id = ?2",
            params![token_id, user_id],
        )?;
        if rows == 0 {
            return Err(Error::InvalidToken);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        (temp, store)
    }

    #[test]
    fn test_initialize_creates_tables() {
        let (_temp, store) = store();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["user", "groups", "member", "certificate", "access", "repo", "token"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_initialize_is_idempotent_and_migrates_legacy_tables() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE user (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    password TEXT,
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    secret TEXT NOT NULL DEFAULT ''
                );
                INSERT INTO user (name, password, created_at) VALUES ('old', 'x', '2020-01-01 00:00:00');",
            )
            .unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        store.initialize().unwrap();
        store.initialize().unwrap();

        let user = store.get_user_by_name("OLD").unwrap().unwrap();
        assert_eq!(user.name, "old");
        assert!(!user.secure_transfer);
    }

    #[test]
    fn test_user_names_are_case_insensitively_unique() {
        let (_temp, store) = store();
        store.create_user("alice", Some("hash")).unwrap();

        let result = store.create_user("ALICE", Some("hash"));
        assert!(matches!(result, Err(Error::NameTaken)));

        let result = store.create_user("9lives", Some("hash"));
        assert!(matches!(result, Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_non_ascii_names_cannot_dodge_case_folding() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();

        assert!(matches!(
            store.create_user("Émile", None),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            store.create_user("émile", None),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            store.create_group(alice.id, "Équipe", ""),
            Err(Error::InvalidName(_))
        ));
        store.create_repo(alice.id, "Outils", "").unwrap();
        assert!(matches!(
            store.create_repo(alice.id, "ÖUTILS", ""),
            Err(Error::InvalidName(_))
        ));
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_repo_owner_checks() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        let bob = store.create_user("bob", None).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();

        assert!(matches!(
            store.toggle_repo_public(bob.id, repo.id),
            Err(Error::NotRepoOwner(_))
        ));
        assert!(matches!(
            store.delete_repo(alice.id, 999),
            Err(Error::RepoNotFound)
        ));

        assert!(store.toggle_repo_public(alice.id, repo.id).unwrap());
        assert!(!store.toggle_repo_public(alice.id, repo.id).unwrap());

        store.create_repo(alice.id, "other", "").unwrap();
        assert!(matches!(
            store.rename_repo(alice.id, repo.id, "OTHER"),
            Err(Error::NameTaken)
        ));
        store.rename_repo(alice.id, repo.id, "toolbox").unwrap();
        assert!(store.get_repo("Alice", "TOOLBOX").unwrap().is_some());
    }

    #[test]
    fn test_group_membership_rules() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        let bob = store.create_user("bob", None).unwrap();
        let carol = store.create_user("carol", None).unwrap();

        let group = store.create_group(alice.id, "core", "").unwrap();
        let members = store.list_group_members(group.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, alice.id);

        store.add_group_member(alice.id, group.id, "bob").unwrap();
        store.add_group_member(alice.id, group.id, "carol").unwrap();
        assert!(matches!(
            store.add_group_member(alice.id, group.id, "BOB"),
            Err(Error::AlreadyMember)
        ));
        assert!(matches!(
            store.add_group_member(bob.id, group.id, "dave"),
            Err(Error::NotGroupOwner(_))
        ));

        assert!(matches!(
            store.remove_group_member(bob.id, group.id, "carol"),
            Err(Error::NotGroupOwner(_))
        ));
        assert!(matches!(
            store.remove_group_member(alice.id, group.id, "alice"),
            Err(Error::OwnerCannotLeave)
        ));
        store.remove_group_member(carol.id, group.id, "carol").unwrap();
        store.remove_group_member(alice.id, group.id, "bob").unwrap();

        assert_eq!(store.list_user_groups(bob.id).unwrap().len(), 0);
        assert_eq!(
            store.get_group_owner(group.id).unwrap().unwrap().id,
            alice.id
        );

        assert!(matches!(
            store.delete_group(bob.id, group.id),
            Err(Error::NotGroupOwner(_))
        ));
        store.delete_group(alice.id, group.id).unwrap();
        assert!(store.get_group("core").unwrap().is_none());
    }

    #[test]
    fn test_access_grants() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        let bob = store.create_user("bob", None).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();

        assert!(matches!(
            store.add_user_access(alice.id, repo.id, "alice"),
            Err(Error::OwnerAsContributor)
        ));
        store.add_user_access(alice.id, repo.id, "bob").unwrap();
        assert!(matches!(
            store.add_user_access(alice.id, repo.id, "bob"),
            Err(Error::AlreadyContributor(Contributor::User))
        ));
        assert_eq!(
            store.get_user_access(repo.id, bob.id).unwrap(),
            Some(Privilege::Read)
        );

        store
            .set_user_access(alice.id, repo.id, "bob", Privilege::Write)
            .unwrap();
        assert_eq!(
            store.get_user_access(repo.id, bob.id).unwrap(),
            Some(Privilege::Write)
        );

        store.remove_user_access(alice.id, repo.id, "bob").unwrap();
        assert!(matches!(
            store.remove_user_access(alice.id, repo.id, "bob"),
            Err(Error::NotContributor(Contributor::User))
        ));
        assert_eq!(store.get_user_access(repo.id, bob.id).unwrap(), None);
    }

    #[test]
    fn test_group_access_takes_highest_grant() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        let bob = store.create_user("bob", None).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();

        let core = store.create_group(alice.id, "core", "").unwrap();
        let ops = store.create_group(alice.id, "ops", "").unwrap();
        store.add_group_member(alice.id, core.id, "bob").unwrap();
        store.add_group_member(alice.id, ops.id, "bob").unwrap();

        assert_eq!(store.get_group_access_for_user(repo.id, bob.id).unwrap(), None);

        store.add_group_access(alice.id, repo.id, "core").unwrap();
        store.add_group_access(alice.id, repo.id, "ops").unwrap();
        store
            .set_group_access(alice.id, repo.id, "ops", Privilege::Write)
            .unwrap();

        assert_eq!(
            store.get_group_access_for_user(repo.id, bob.id).unwrap(),
            Some(Privilege::Write)
        );

        let shared = store.repos_with_read_access(bob.id).unwrap();
        assert_eq!(shared.len(), 1);
        assert!(store.repos_with_read_access(alice.id).unwrap().is_empty());

        let grants = store.list_repo_access(repo.id).unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|g| matches!(g.subject, AccessSubject::Group(_))));
    }

    #[test]
    fn test_deleting_group_cascades_to_access() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        let group = store.create_group(alice.id, "core", "").unwrap();
        store.add_group_access(alice.id, repo.id, "core").unwrap();

        store.delete_group(alice.id, group.id).unwrap();
        assert!(store.list_repo_access(repo.id).unwrap().is_empty());
    }

    #[test]
    fn test_deleting_user_cascades_to_repos() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        store.create_session("F1", alice.id, false).unwrap();

        assert!(store.delete_user(alice.id).unwrap());
        assert!(store.get_repo_by_id(repo.id).unwrap().is_none());
        assert!(store.get_session("F1").unwrap().is_none());
    }

    #[test]
    fn test_sessions() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();

        store.create_session("F1", alice.id, true).unwrap();
        store.create_session("F2", alice.id, false).unwrap();

        let (session, user) = store.get_session("F1").unwrap().unwrap();
        assert!(session.pending_otp);
        assert_eq!(user.name, "alice");

        assert!(store.confirm_session("F1").unwrap());
        assert!(!store.get_session("F1").unwrap().unwrap().0.pending_otp);

        assert_eq!(store.delete_user_sessions(alice.id, Some("F1")).unwrap(), 1);
        assert!(store.get_session("F2").unwrap().is_none());

        let removed = store
            .delete_sessions_before(Utc::now() + Duration::seconds(5))
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_token_hash_collision() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();

        let token = NewToken {
            user_id: alice.id,
            hash: "hash1".to_string(),
            hint: "abcd".to_string(),
            expires_at: Utc::now() + Duration::days(30),
            read_only: true,
        };
        store.create_token(&token).unwrap();

        let result = store.create_token(&token);
        assert!(matches!(result, Err(Error::TokenHashCollision)));
    }

    #[test]
    fn test_token_lookup_is_bound_to_user_name() {
        let (_temp, store) = store();
        let alice = store.create_user("alice", None).unwrap();
        store.create_user("bob", None).unwrap();

        let created = store
            .create_token(&NewToken {
                user_id: alice.id,
                hash: "h".to_string(),
                hint: "abcd".to_string(),
                expires_at: Utc::now() + Duration::days(30),
                read_only: false,
            })
            .unwrap();

        assert!(store.get_token_for_user("Alice", "h").unwrap().is_some());
        assert!(store.get_token_for_user("bob", "h").unwrap().is_none());

        assert!(matches!(
            store.delete_token(alice.id + 1, created.id),
            Err(Error::InvalidToken)
        ));
        store.delete_token(alice.id, created.id).unwrap();
        assert!(store.list_user_tokens(alice.id).unwrap().is_empty());
    }
}
