//! SQLite-backed [`CredentialStore`] and [`MessageLog`].
//!
//! A single connection guarded by a mutex. File databases run in WAL mode
//! with a bounded busy timeout so a locked database surfaces as an error
//! instead of a hang.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::store::{
    CredentialStore, MessageLog, MessageRecord, StoreError, UserRecord, Visibility,
};

/// Longest time a statement waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        username      TEXT PRIMARY KEY COLLATE NOCASE,
        password_hash TEXT NOT NULL,
        is_online     INTEGER NOT NULL DEFAULT 0,
        connected_at  TEXT,
        created_at    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id         TEXT PRIMARY KEY,
        sender     TEXT NOT NULL,
        content    TEXT NOT NULL,
        sent_at    TEXT NOT NULL,
        recipient  TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at);
";

/// Credential store and message log in one SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the file cannot be opened, or another
    /// [`StoreError`] if the directory or schema cannot be set up.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the newest `limit` messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log cannot be read.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<MessageRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender, content, sent_at, recipient FROM messages
             ORDER BY rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut messages = rows
            .into_iter()
            .map(|(id, sender, content, timestamp, recipient)| {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Corrupt(format!("message id {id}: {e}")))?;
                Ok(MessageRecord {
                    id,
                    sender,
                    content,
                    timestamp,
                    visibility: recipient
                        .map_or(Visibility::Public, |target| Visibility::Private { target }),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Number of registered users.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn user_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        username: row.get(0)?,
        password_hash: row.get(1)?,
        is_online: row.get(2)?,
        connected_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl CredentialStore for SqliteStore {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let user = self
            .conn
            .lock()
            .query_row(
                "SELECT username, password_hash, is_online, connected_at, created_at
                 FROM users WHERE username = ?1",
                [username],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn create(&self, username: &str, password_hash: &str) -> Result<UserRecord, StoreError> {
        let record = UserRecord {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            is_online: false,
            connected_at: None,
            created_at: Utc::now(),
        };
        let result = self.conn.lock().execute(
            "INSERT INTO users (username, password_hash, is_online, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![record.username, record.password_hash, record.created_at],
        );
        match result {
            Ok(_) => Ok(record),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateUser(username.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_online(&self, username: &str, online: bool) -> Result<(), StoreError> {
        let updated = if online {
            self.conn.lock().execute(
                "UPDATE users SET is_online = 1, connected_at = ?2 WHERE username = ?1",
                params![username, Utc::now()],
            )?
        } else {
            self.conn.lock().execute(
                "UPDATE users SET is_online = 0 WHERE username = ?1",
                [username],
            )?
        };
        if updated == 0 {
            tracing::warn!(username = %username, online, "set_online on missing user record");
        }
        Ok(())
    }

    fn reset_all_offline(&self) -> Result<usize, StoreError> {
        let cleared = self
            .conn
            .lock()
            .execute("UPDATE users SET is_online = 0 WHERE is_online = 1", [])?;
        Ok(cleared)
    }
}

impl MessageLog for SqliteStore {
    fn append(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO messages (id, sender, content, sent_at, recipient)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.sender,
                record.content,
                record.timestamp,
                record.visibility.target(),
            ],
        )?;
        Ok(())
    }
}
