// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for routing between authenticated sessions.
//!
//! Covers public broadcast, whispers (including to offline users), join
//! and leave notices, and what is persisted to the message log along the
//! way. Each test runs a real server with an in-memory store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use echo_proto::ServerFrame;
use echo_server::hashing::{CredentialHasher, HashCost};
use echo_server::server::{self, ChatState};
use echo_server::sqlite::SqliteStore;
use echo_server::store::{CredentialStore, Visibility};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    addr: SocketAddr,
    state: Arc<ChatState>,
    store: Arc<SqliteStore>,
}

impl Harness {
    async fn start() -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let hasher = CredentialHasher::new(HashCost {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap();
        let state = Arc::new(ChatState::new(Arc::clone(&store), hasher));
        let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        Self { addr, state, store }
    }

    /// Connect and authenticate, consuming the welcome frame.
    async fn join(&self, username: &str, password: &str) -> Client {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", self.addr))
            .await
            .unwrap();
        let creds = format!(r#"{{"username":"{username}","password":"{password}"}}"#);
        ws.send(Message::Text(creds.into())).await.unwrap();
        assert_eq!(
            recv(&mut ws).await.as_deref(),
            Some(format!("Welcome to Echo, {username}!").as_str())
        );
        ws
    }

    /// Wait until the server has fully torn down `username`'s session.
    async fn wait_offline(&self, username: &str) {
        for _ in 0..200 {
            let persisted = self
                .store
                .find_by_username(username)
                .unwrap()
                .is_some_and(|u| u.is_online);
            if !persisted && !self.state.sessions().is_online(username).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{username} still online");
    }
}

async fn say(ws: &mut Client, line: &str) {
    ws.send(Message::Text(line.into())).await.unwrap();
}

/// Next text frame, or `None` once the server has closed the socket.
async fn recv(ws: &mut Client) -> Option<String> {
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match next {
            Some(Ok(Message::Text(text))) => return Some(text.as_str().to_string()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next frame parsed as a [`ServerFrame`].
async fn recv_frame(ws: &mut Client) -> ServerFrame {
    let text = recv(ws).await.expect("connection closed");
    ServerFrame::parse(&text).unwrap_or_else(|| panic!("unrecognized frame: {text}"))
}

/// Assert nothing arrives for a short while.
async fn assert_silent(ws: &mut Client) {
    if let Ok(frame) = tokio::time::timeout(QUIET_PERIOD, ws.next()).await {
        panic!("expected silence, got {frame:?}");
    }
}

fn assert_chat(frame: &ServerFrame, expected_sender: &str, expected_body: &str) {
    match frame {
        ServerFrame::Chat { sender, body, .. } => {
            assert_eq!(sender, expected_sender);
            assert_eq!(body, expected_body);
        }
        other => panic!("expected chat, got {other:?}"),
    }
}

fn assert_whisper(frame: &ServerFrame, expected_sender: &str, expected_body: &str) {
    match frame {
        ServerFrame::Whisper { sender, body, .. } => {
            assert_eq!(sender, expected_sender);
            assert_eq!(body, expected_body);
        }
        other => panic!("expected whisper, got {other:?}"),
    }
}

// =============================================================================
// Scenario
// =============================================================================

#[tokio::test]
async fn two_users_join_chat_and_leave() {
    let h = Harness::start().await;

    let mut alice = h.join("alice", "pw1").await;
    assert_silent(&mut alice).await;

    let mut bob = h.join("bob", "pw2").await;
    assert_eq!(recv(&mut alice).await.unwrap(), "bob has joined");

    say(&mut bob, "hello team").await;
    let to_alice = recv(&mut alice).await.unwrap();
    assert!(to_alice.ends_with(": bob said: hello team"), "{to_alice}");
    assert_chat(&recv_frame(&mut bob).await, "bob", "hello team");

    bob.close(None).await.unwrap();
    assert_eq!(recv(&mut alice).await.unwrap(), "bob has left");
    h.wait_offline("bob").await;
    assert_eq!(h.state.sessions().usernames().await, vec!["alice".to_string()]);
}

// =============================================================================
// Broadcast
// =============================================================================

#[tokio::test]
async fn broadcast_reaches_every_session_exactly_once() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let mut bob = h.join("bob", "pw2").await;
    let mut carol = h.join("carol", "pw3").await;
    assert_eq!(recv(&mut alice).await.unwrap(), "bob has joined");
    assert_eq!(recv(&mut alice).await.unwrap(), "carol has joined");
    assert_eq!(recv(&mut bob).await.unwrap(), "carol has joined");

    say(&mut alice, "hi everyone").await;

    for ws in [&mut alice, &mut bob, &mut carol] {
        assert_chat(&recv_frame(ws).await, "alice", "hi everyone");
        assert_silent(ws).await;
    }

    let log = h.store.recent_messages(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].sender, "alice");
    assert_eq!(log[0].content, "hi everyone");
    assert_eq!(log[0].visibility, Visibility::Public);
}

#[tokio::test]
async fn blank_lines_are_ignored() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;

    say(&mut alice, "   ").await;
    say(&mut alice, "after").await;

    assert_chat(&recv_frame(&mut alice).await, "alice", "after");
    assert_eq!(h.store.recent_messages(10).unwrap().len(), 1);
}

#[tokio::test]
async fn incomplete_whisper_is_broadcast() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let mut bob = h.join("bob", "pw2").await;
    let _ = recv(&mut alice).await;

    say(&mut alice, "!w bob").await;

    assert_chat(&recv_frame(&mut alice).await, "alice", "!w bob");
    assert_chat(&recv_frame(&mut bob).await, "alice", "!w bob");
}

// =============================================================================
// Whisper
// =============================================================================

#[tokio::test]
async fn whisper_reaches_only_sender_and_target() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let mut bob = h.join("bob", "pw2").await;
    let mut carol = h.join("carol", "pw3").await;
    let _ = recv(&mut alice).await;
    let _ = recv(&mut alice).await;
    let _ = recv(&mut bob).await;

    say(&mut alice, "!w bob hello").await;

    let to_bob = recv(&mut bob).await.unwrap();
    assert!(to_bob.ends_with(": alice privately said: hello"), "{to_bob}");
    assert_whisper(&recv_frame(&mut alice).await, "alice", "hello");
    assert_silent(&mut carol).await;

    let log = h.store.recent_messages(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(
        log[0].visibility,
        Visibility::Private {
            target: "bob".into()
        }
    );
}

#[tokio::test]
async fn whisper_target_is_case_insensitive() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let mut bob = h.join("Bob", "pw2").await;
    let _ = recv(&mut alice).await;

    say(&mut alice, "!WHISPER bOB  psst, over here").await;

    assert_whisper(&recv_frame(&mut bob).await, "alice", "psst, over here");
    let log = h.store.recent_messages(10).unwrap();
    assert_eq!(log[0].visibility.target(), Some("Bob"));
}

#[tokio::test]
async fn whisper_to_offline_user_notifies_sender_only() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let mut bob = h.join("bob", "pw2").await;
    let _ = recv(&mut alice).await;

    say(&mut alice, "!w dave are you there").await;

    assert_eq!(recv(&mut alice).await.unwrap(), "User dave is not online");
    assert_silent(&mut bob).await;
    assert!(h.store.recent_messages(10).unwrap().is_empty());
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_sends_one_leave_notice_and_goes_offline() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let mut bob = h.join("bob", "pw2").await;
    let mut carol = h.join("carol", "pw3").await;
    let _ = recv(&mut alice).await;
    let _ = recv(&mut alice).await;
    let _ = recv(&mut bob).await;

    carol.close(None).await.unwrap();
    while recv(&mut carol).await.is_some() {}

    for ws in [&mut alice, &mut bob] {
        assert_eq!(recv(ws).await.unwrap(), "carol has left");
        assert_silent(ws).await;
    }
    h.wait_offline("carol").await;
    assert!(!h.store.find_by_username("carol").unwrap().unwrap().is_online);
    assert_eq!(h.state.sessions().len().await, 2);
}

#[tokio::test]
async fn dropped_socket_is_cleaned_up() {
    let h = Harness::start().await;
    let mut alice = h.join("alice", "pw1").await;
    let bob = h.join("bob", "pw2").await;
    let _ = recv(&mut alice).await;

    drop(bob);

    assert_eq!(recv(&mut alice).await.unwrap(), "bob has left");
    h.wait_offline("bob").await;

    // bob can come straight back.
    let _bob = h.join("bob", "pw2").await;
    assert_eq!(recv(&mut alice).await.unwrap(), "bob has joined");
}
