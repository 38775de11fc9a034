//! One-shot authentication handshake and session teardown.
//!
//! Both directions of a session's lifetime run under the username's lock
//! from [`crate::sessions::UsernameLocks`], so the persisted online flag and
//! the session registry change together: a user is marked online in the
//! credential store exactly while a session for them is registered.

use axum::extract::ws::Message;
use echo_proto::{Credentials, CredentialsError, RejectReason, ServerFrame};
use tokio::sync::mpsc;

use crate::hashing::HashError;
use crate::router;
use crate::server::ChatState;
use crate::sessions::{Admission, ConnectionId, Session};
use crate::store::{StoreError, UserRecord};

/// Why a handshake did not produce a session.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The first frame was not a usable credentials payload.
    #[error("malformed credentials: {0}")]
    BadCredentialsFormat(#[from] CredentialsError),
    /// The username already has a live session.
    #[error("user is already online")]
    AlreadyOnline,
    /// The password does not match the stored hash.
    #[error("wrong password")]
    WrongPassword,
    /// No credentials arrived in time.
    #[error("no credentials received before the handshake timeout")]
    HandshakeTimeout,
    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The credential store failed.
    #[error(transparent)]
    Persistence(#[from] StoreError),
    /// Password hashing failed.
    #[error(transparent)]
    Hashing(#[from] HashError),
}

impl AuthError {
    /// The reason reported to the client in the `ERROR:` frame.
    ///
    /// Internal failures are reported generically.
    #[must_use]
    pub const fn reject_reason(&self) -> RejectReason {
        match self {
            Self::BadCredentialsFormat(_) => RejectReason::BadCredentialsFormat,
            Self::AlreadyOnline => RejectReason::AlreadyOnline,
            Self::WrongPassword => RejectReason::WrongPassword,
            Self::HandshakeTimeout => RejectReason::HandshakeTimeout,
            Self::ShuttingDown => RejectReason::ShuttingDown,
            Self::Persistence(_) | Self::Hashing(_) => RejectReason::Unavailable,
        }
    }
}

/// Authenticates a connection and registers its session.
///
/// Unknown usernames are registered on first use. A username with a live
/// session is refused before its password is checked, so a second client
/// learns nothing about whether its password would have matched.
///
/// On success the welcome frame has been queued on `sender` ahead of any
/// broadcast, the user is marked online, and the session is registered.
/// A handshake that loses the race with shutdown gets no welcome.
///
/// # Errors
///
/// Returns the [`AuthError`] that ends the handshake.
pub async fn authenticate(
    state: &ChatState,
    conn_id: ConnectionId,
    creds: &Credentials,
    sender: mpsc::UnboundedSender<Message>,
) -> Result<Session, AuthError> {
    if state.is_shutting_down() {
        return Err(AuthError::ShuttingDown);
    }

    let _guard = state.locks.acquire(&creds.username).await;

    let user = match state.credentials.find_by_username(&creds.username)? {
        Some(user) => {
            check_password(state, &user, &creds.password).await?;
            user
        }
        None => register(state, creds).await?,
    };

    state.credentials.set_online(&user.username, true)?;

    let welcome = ServerFrame::Welcome {
        username: user.username.clone(),
    };
    match state
        .sessions
        .admit(conn_id, &user.username, sender, Some(&welcome.to_string()))
        .await
    {
        Admission::Admitted => {}
        Admission::Duplicate => {
            tracing::error!(%conn_id, "connection already carries a session");
            release_online_flag(state, &user.username);
            return Err(AuthError::AlreadyOnline);
        }
        Admission::Closed => {
            release_online_flag(state, &user.username);
            return Err(AuthError::ShuttingDown);
        }
    }

    Ok(Session {
        conn_id,
        username: user.username,
    })
}

/// Applies the rules for an existing account: online users are refused
/// outright, everyone else must present the right password.
async fn check_password(
    state: &ChatState,
    user: &UserRecord,
    password: &str,
) -> Result<(), AuthError> {
    if user.is_online {
        return Err(AuthError::AlreadyOnline);
    }
    if !state
        .hasher
        .verify_blocking(password, &user.password_hash)
        .await?
    {
        return Err(AuthError::WrongPassword);
    }
    Ok(())
}

async fn register(state: &ChatState, creds: &Credentials) -> Result<UserRecord, AuthError> {
    let hash = state.hasher.hash_blocking(&creds.password).await?;
    match state.credentials.create(&creds.username, &hash) {
        Ok(user) => {
            tracing::info!(username = %user.username, "registered new user");
            Ok(user)
        }
        Err(StoreError::DuplicateUser(_)) => {
            // Created by another writer since the lookup; log in instead.
            let user = state
                .credentials
                .find_by_username(&creds.username)?
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("user {} vanished after create", creds.username))
                })?;
            check_password(state, &user, &creds.password).await?;
            Ok(user)
        }
        Err(e) => Err(e.into()),
    }
}

fn release_online_flag(state: &ChatState, username: &str) {
    if let Err(e) = state.credentials.set_online(username, false) {
        tracing::warn!(username = %username, error = %e, "failed to clear online flag");
    }
}

/// Ends an authenticated session: unregisters it, marks the user offline
/// and tells everyone still online.
///
/// Returns `false` if the session was already gone, in which case nothing
/// is done, so calling this more than once is harmless.
pub async fn end_session(state: &ChatState, session: &Session) -> bool {
    let guard = state.locks.acquire(&session.username).await;
    let Some(username) = state.sessions.remove(session.conn_id).await else {
        return false;
    };
    release_online_flag(state, &username);

    tracing::info!(conn_id = %session.conn_id, username = %username, "session ended");
    // Under the guard, so a reconnect's join notice cannot overtake it.
    router::broadcast(state, &ServerFrame::Left { username }, None).await;
    drop(guard);
    true
}
