//! Live session registry and per-username serialization.
//!
//! [`SessionRegistry`] maps each authenticated connection to its username
//! and the sender half of its outbound channel. It is the single source of
//! truth for who is online right now. [`UsernameLocks`] serializes the
//! online/offline transitions of one username so that the registry and the
//! persisted online flag always change together.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use uuid::Uuid;

/// Identity of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocates a new, time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An authenticated binding between one connection and one username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// The connection carrying the session.
    pub conn_id: ConnectionId,
    /// Canonical username from the credential store.
    pub username: String,
}

/// A delivery target taken from a registry snapshot.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Connection of the target session.
    pub conn_id: ConnectionId,
    /// Username of the target session.
    pub username: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl Recipient {
    /// Queues a text frame for this recipient.
    ///
    /// Delivery is at most once and best effort: returns `false` if the
    /// connection is no longer writable, without affecting anyone else.
    pub fn deliver(&self, text: &str) -> bool {
        let delivered = self
            .sender
            .send(Message::Text(text.to_string().into()))
            .is_ok();
        if !delivered {
            tracing::debug!(
                conn_id = %self.conn_id,
                username = %self.username,
                "delivery failed, connection no longer writable"
            );
        }
        delivered
    }

    /// Queues a Close frame, ending the connection once it is written.
    pub fn close(&self) {
        let _ = self.sender.send(Message::Close(None));
    }
}

struct Entry {
    username: String,
    sender: mpsc::UnboundedSender<Message>,
}

/// Outcome of [`SessionRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The session is registered.
    Admitted,
    /// The connection already carries a session.
    Duplicate,
    /// The registry has been closed for shutdown.
    Closed,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<ConnectionId, Entry>,
    closed: bool,
}

/// In-memory map of live sessions keyed by connection.
///
/// Reads hand out cloned snapshots, so broadcasting never holds the lock
/// while writing to connections.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Sessions>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session unless the connection already has one or the
    /// registry is closed.
    ///
    /// `greeting` is queued on `sender` under the same write lock, so it
    /// reaches the client before anything broadcast to the new session and
    /// is never sent when admission fails.
    pub async fn admit(
        &self,
        conn_id: ConnectionId,
        username: &str,
        sender: mpsc::UnboundedSender<Message>,
        greeting: Option<&str>,
    ) -> Admission {
        let mut sessions = self.sessions.write().await;
        if sessions.closed {
            return Admission::Closed;
        }
        if sessions.entries.contains_key(&conn_id) {
            return Admission::Duplicate;
        }
        if let Some(greeting) = greeting {
            let _ = sender.send(Message::Text(greeting.to_string().into()));
        }
        sessions.entries.insert(
            conn_id,
            Entry {
                username: username.to_string(),
                sender,
            },
        );
        Admission::Admitted
    }

    /// Refuses all further admissions and returns every live session.
    ///
    /// A session admitted concurrently is either refused or included in the
    /// returned list, never neither.
    pub async fn close(&self) -> Vec<Recipient> {
        let mut sessions = self.sessions.write().await;
        sessions.closed = true;
        recipients(&sessions.entries)
    }

    /// Removes a connection's session, returning its username if it existed.
    pub async fn remove(&self, conn_id: ConnectionId) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        sessions.entries.remove(&conn_id).map(|e| e.username)
    }

    /// Finds the live session for a username, ignoring case.
    pub async fn find_by_username(&self, username: &str) -> Option<Recipient> {
        let sessions = self.sessions.read().await;
        sessions
            .entries
            .iter()
            .find(|(_, e)| e.username.eq_ignore_ascii_case(username))
            .map(|(id, e)| Recipient {
                conn_id: *id,
                username: e.username.clone(),
                sender: e.sender.clone(),
            })
    }

    /// Returns the recipient for a connection, if it is registered.
    pub async fn get(&self, conn_id: ConnectionId) -> Option<Recipient> {
        let sessions = self.sessions.read().await;
        sessions.entries.get(&conn_id).map(|e| Recipient {
            conn_id,
            username: e.username.clone(),
            sender: e.sender.clone(),
        })
    }

    /// Copies out every live session.
    pub async fn snapshot(&self) -> Vec<Recipient> {
        recipients(&self.sessions.read().await.entries)
    }

    /// Usernames of every live session, sorted.
    pub async fn usernames(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut names: Vec<String> = sessions.entries.values().map(|e| e.username.clone()).collect();
        drop(sessions);
        names.sort();
        names
    }

    /// Whether a username currently has a live session, ignoring case.
    pub async fn is_online(&self, username: &str) -> bool {
        self.find_by_username(username).await.is_some()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.entries.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.entries.is_empty()
    }
}

fn recipients(entries: &HashMap<ConnectionId, Entry>) -> Vec<Recipient> {
    entries
        .iter()
        .map(|(id, e)| Recipient {
            conn_id: *id,
            username: e.username.clone(),
            sender: e.sender.clone(),
        })
        .collect()
}

/// One async mutex per username, created on demand.
///
/// Entries are removed when the last holder or waiter lets go, so the map
/// only ever holds usernames with an in-flight transition.
#[derive(Default)]
pub struct UsernameLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the serialization point for one username until dropped.
pub struct UsernameGuard<'a> {
    locks: &'a UsernameLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UsernameLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `username` (case-insensitive).
    pub async fn acquire(&self, username: &str) -> UsernameGuard<'_> {
        let key = username.to_lowercase();
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        UsernameGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for UsernameGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock();
        drop(self.guard.take());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
