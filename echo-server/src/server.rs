//! Shared chat state, the per-connection supervisor, and the WebSocket
//! endpoint.
//!
//! Each connection is driven by one task that owns an explicit
//! [`ConnectionState`]. The first text frame must carry credentials; after
//! a successful handshake every text frame is a chat line handed to the
//! [`crate::router`]. Outbound frames go through an unbounded channel
//! drained by a dedicated writer task, so routing never awaits a slow
//! socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use echo_proto::{Credentials, CredentialsError, ServerFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::{self, AuthError};
use crate::hashing::CredentialHasher;
use crate::router;
use crate::sessions::{ConnectionId, Session, SessionRegistry, UsernameLocks};
use crate::store::{CredentialStore, MessageLog};

/// Default maximum inbound WebSocket message size in bytes (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// How long a closing connection waits for its queued frames to flush.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was attempted.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The bound address could not be read back.
    #[error("failed to read local address: {0}")]
    LocalAddr(std::io::Error),
}

/// State shared by every connection.
pub struct ChatState {
    pub(crate) sessions: SessionRegistry,
    pub(crate) locks: UsernameLocks,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) messages: Arc<dyn MessageLog>,
    pub(crate) hasher: CredentialHasher,
    handshake_timeout: Option<Duration>,
    max_frame_size: usize,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
    connections: TaskTracker,
}

impl ChatState {
    /// Creates state backed by one store acting as both credential store
    /// and message log.
    #[must_use]
    pub fn new<S>(store: Arc<S>, hasher: CredentialHasher) -> Self
    where
        S: CredentialStore + MessageLog + 'static,
    {
        let credentials: Arc<dyn CredentialStore> = Arc::clone(&store) as _;
        Self::with_stores(credentials, store, hasher)
    }

    /// Creates state from separate credential and message stores.
    #[must_use]
    pub fn with_stores(
        credentials: Arc<dyn CredentialStore>,
        messages: Arc<dyn MessageLog>,
        hasher: CredentialHasher,
    ) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            locks: UsernameLocks::new(),
            credentials,
            messages,
            hasher,
            handshake_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Closes connections that send no credentials within `timeout`.
    /// `None` waits forever.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the largest inbound message accepted.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// The live session registry.
    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Whether [`Self::shutdown`] has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts shutdown: refuses new handshakes, then sends the shutdown
    /// notice and a Close frame to every connection, authenticated or not.
    ///
    /// Each connection then runs its normal cleanup; [`Self::wait_closed`]
    /// resolves once all of them have finished. Only the first call has any
    /// effect.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        self.connections.close();
        let recipients = self.sessions.close().await;
        tracing::info!(sessions = recipients.len(), "shutting down, closing all sessions");
        let notice = ServerFrame::ShuttingDown.to_string();
        for recipient in &recipients {
            recipient.deliver(&notice);
            recipient.close();
        }
    }

    /// Resolves once shutdown has begun and every connection task has
    /// finished.
    pub async fn wait_closed(&self) {
        self.connections.wait().await;
    }

    /// Number of connection tasks still running.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }
}

/// Where a connection is in its lifecycle.
enum ConnectionState {
    /// Waiting for the credentials frame.
    AwaitingCredentials,
    /// Handshake succeeded; frames are chat lines.
    Authenticated(Session),
    /// Done. Cleanup, if any, has run.
    Closed,
}

/// One inbound event, with control frames already filtered out.
enum Inbound {
    Text(String),
    Binary,
    Closed,
    TimedOut,
    ShuttingDown,
}

/// Drives one upgraded WebSocket connection to completion.
///
/// An authenticated session is torn down exactly once, on whichever of
/// client close, read error or write failure happens first. Shutdown
/// reaches authenticated sessions through the registry and unauthenticated
/// ones through the shutdown token.
pub async fn handle_socket(socket: WebSocket, state: Arc<ChatState>) {
    let conn_id = ConnectionId::new();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let mut write_task = tokio::spawn(write_loop(conn_id, ws_sender, rx));
    let mut writer_finished = false;

    tracing::debug!(%conn_id, "connection accepted");

    let deadline = state.handshake_timeout.map(|t| Instant::now() + t);
    let mut conn_state = ConnectionState::AwaitingCredentials;

    loop {
        let awaiting = matches!(conn_state, ConnectionState::AwaitingCredentials);
        let inbound = tokio::select! {
            inbound = next_inbound(&mut ws_receiver, deadline.filter(|_| awaiting)) => inbound,
            () = state.shutdown_token.cancelled(), if awaiting => Inbound::ShuttingDown,
            _ = &mut write_task => {
                writer_finished = true;
                Inbound::Closed
            }
        };

        conn_state = match conn_state {
            ConnectionState::AwaitingCredentials => match inbound {
                Inbound::Text(text) => handshake(&state, conn_id, &text, &tx).await,
                Inbound::Binary => reject(
                    conn_id,
                    &tx,
                    &AuthError::BadCredentialsFormat(CredentialsError::Decode(
                        "expected a text frame".into(),
                    )),
                ),
                Inbound::TimedOut => reject(conn_id, &tx, &AuthError::HandshakeTimeout),
                Inbound::ShuttingDown => {
                    tracing::debug!(%conn_id, "closing unauthenticated connection for shutdown");
                    let _ = tx.send(Message::Text(ServerFrame::ShuttingDown.to_string().into()));
                    let _ = tx.send(Message::Close(None));
                    ConnectionState::Closed
                }
                Inbound::Closed => {
                    tracing::debug!(%conn_id, "connection closed before authentication");
                    ConnectionState::Closed
                }
            },
            ConnectionState::Authenticated(session) => match inbound {
                Inbound::Text(line) => {
                    router::route_line(&state, &session, &line).await;
                    ConnectionState::Authenticated(session)
                }
                Inbound::Binary => {
                    tracing::debug!(%conn_id, "ignoring binary frame");
                    ConnectionState::Authenticated(session)
                }
                Inbound::TimedOut | Inbound::ShuttingDown => ConnectionState::Authenticated(session),
                Inbound::Closed => {
                    auth::end_session(&state, &session).await;
                    ConnectionState::Closed
                }
            },
            ConnectionState::Closed => ConnectionState::Closed,
        };

        if matches!(conn_state, ConnectionState::Closed) {
            break;
        }
    }

    drop(tx);
    if !writer_finished && tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut write_task).await.is_err() {
        write_task.abort();
    }
    tracing::debug!(%conn_id, "connection finished");
}

/// Handles the credentials frame, returning the next connection state.
async fn handshake(
    state: &ChatState,
    conn_id: ConnectionId,
    text: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> ConnectionState {
    let result = match Credentials::from_json(text) {
        Ok(creds) => auth::authenticate(state, conn_id, &creds, tx.clone()).await,
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(session) => {
            tracing::info!(%conn_id, username = %session.username, "session authenticated");
            let joined = ServerFrame::Joined {
                username: session.username.clone(),
            };
            router::broadcast(state, &joined, Some(conn_id)).await;
            ConnectionState::Authenticated(session)
        }
        Err(e) => reject(conn_id, tx, &e),
    }
}

/// Queues the rejection frame and a Close, ending the connection.
fn reject(
    conn_id: ConnectionId,
    tx: &mpsc::UnboundedSender<Message>,
    error: &AuthError,
) -> ConnectionState {
    match error {
        AuthError::Persistence(_) | AuthError::Hashing(_) => {
            tracing::error!(%conn_id, error = %error, "handshake failed");
        }
        _ => tracing::warn!(%conn_id, error = %error, "handshake rejected"),
    }
    let frame = ServerFrame::Rejected(error.reject_reason());
    let _ = tx.send(Message::Text(frame.to_string().into()));
    let _ = tx.send(Message::Close(None));
    ConnectionState::Closed
}

/// Waits for the next text or binary frame, skipping pings and pongs.
///
/// With a `deadline`, reports [`Inbound::TimedOut`] once it passes.
async fn next_inbound(
    receiver: &mut SplitStream<WebSocket>,
    deadline: Option<Instant>,
) -> Inbound {
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, receiver.next()).await {
                Ok(next) => next,
                Err(_) => return Inbound::TimedOut,
            },
            None => receiver.next().await,
        };
        match next {
            Some(Ok(Message::Text(text))) => return Inbound::Text(text.as_str().to_owned()),
            Some(Ok(Message::Binary(_))) => return Inbound::Binary,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Inbound::Closed,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "websocket read failed");
                return Inbound::Closed;
            }
        }
    }
}

/// Forwards queued frames to the socket until the channel closes, a Close
/// frame has been sent, or a write fails.
async fn write_loop(
    conn_id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            tracing::warn!(%conn_id, error = %e, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

/// axum handler that upgrades an HTTP request to a chat connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ChatState>>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(state.max_frame_size).on_upgrade(move |socket| {
        let connections = state.connections.clone();
        connections.track_future(handle_socket(socket, state))
    })
}

/// Builds the axum application: a single WebSocket endpoint at `/`.
#[must_use]
pub fn app(state: Arc<ChatState>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(ws_handler))
        .with_state(state)
}

/// Starts the server on `addr` and runs it until the task is aborted.
///
/// # Errors
///
/// Returns [`ServerError`] if the listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ChatState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), ServerError> {
    start_server_with_shutdown(addr, state, std::future::pending()).await
}

/// Starts the server on `addr`, shutting down gracefully once `signal`
/// completes.
///
/// On the signal every connection receives the shutdown notice and a Close
/// frame, and the listener stops accepting. The returned task finishes once
/// every connection task has ended, so callers bound it with their grace
/// period.
///
/// # Errors
///
/// Returns [`ServerError`] if the listener cannot bind.
pub async fn start_server_with_shutdown<F>(
    addr: &str,
    state: Arc<ChatState>,
    signal: F,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let bound_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

    let shutdown_state = Arc::clone(&state);
    let app = app(Arc::clone(&state));
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            signal.await;
            shutdown_state.shutdown().await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server error");
        }
        // Upgraded sockets outlive `serve`.
        state.shutdown().await;
        state.wait_closed().await;
        tracing::debug!("all connections closed");
    });

    Ok((bound_addr, handle))
}
