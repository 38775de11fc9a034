//! Persistence contracts for user credentials and the message log.
//!
//! The session manager only talks to these traits. [`crate::sqlite::SqliteStore`]
//! implements both; tests substitute their own implementations to exercise
//! failure paths.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Errors raised by a credential store or message log.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record with this username already exists.
    #[error("user {0} already exists")]
    DuplicateUser(String),
    /// The database could not be opened.
    #[error("failed to open database {path}: {source}")]
    Open {
        /// Path that was attempted.
        path: std::path::PathBuf,
        /// Underlying database error.
        source: rusqlite::Error,
    },
    /// The database directory could not be created.
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// A stored value could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A persisted account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Unique (case-insensitively) account name, as first registered.
    pub username: String,
    /// PHC-format password hash. Opaque to everything but the hasher.
    pub password_hash: String,
    /// Whether a live session exists for this user.
    pub is_online: bool,
    /// When the user last authenticated.
    pub connected_at: Option<DateTime<Utc>>,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

/// Who may see a logged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Broadcast to every session.
    Public,
    /// Whispered to a single user.
    Private {
        /// Canonical username of the recipient.
        target: String,
    },
}

impl Visibility {
    /// The recipient for private messages, `None` for public ones.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Public => None,
            Self::Private { target } => Some(target),
        }
    }
}

/// An immutable entry in the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Time-ordered identifier.
    pub id: Uuid,
    /// Username of the author.
    pub sender: String,
    /// Message text.
    pub content: String,
    /// When the server accepted the message.
    pub timestamp: DateTime<Utc>,
    /// Public or private.
    pub visibility: Visibility,
}

impl MessageRecord {
    /// A public message stamped now.
    #[must_use]
    pub fn public(sender: &str, content: &str) -> Self {
        Self::new(sender, content, Visibility::Public)
    }

    /// A private message to `target` stamped now.
    #[must_use]
    pub fn private(sender: &str, content: &str, target: &str) -> Self {
        Self::new(
            sender,
            content,
            Visibility::Private {
                target: target.to_string(),
            },
        )
    }

    fn new(sender: &str, content: &str, visibility: Visibility) -> Self {
        Self {
            id: Uuid::now_v7(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            visibility,
        }
    }
}

/// Username → password hash and online status.
pub trait CredentialStore: Send + Sync {
    /// Looks up a user by name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Creates an offline user record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateUser`] if the name is already taken.
    fn create(&self, username: &str, password_hash: &str) -> Result<UserRecord, StoreError>;

    /// Sets the online flag, refreshing `connected_at` when going online.
    ///
    /// Idempotent. A missing record is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be written.
    fn set_online(&self, username: &str, online: bool) -> Result<(), StoreError>;

    /// Marks every user offline, returning how many flags were cleared.
    ///
    /// Run once at startup: no session survives a restart, so any persisted
    /// online flag is stale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be written.
    fn reset_all_offline(&self) -> Result<usize, StoreError>;
}

/// Append-only audit log of accepted chat messages.
pub trait MessageLog: Send + Sync {
    /// Persists one message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record cannot be written.
    fn append(&self, record: &MessageRecord) -> Result<(), StoreError>;
}
