//! Routing of chat lines from authenticated sessions.
//!
//! Every accepted message is appended to the [`crate::store::MessageLog`]
//! before it is delivered. A failed append is logged and delivery goes
//! ahead anyway.

use echo_proto::{ChatCommand, ServerFrame, command};

use crate::server::ChatState;
use crate::sessions::{ConnectionId, Session};
use crate::store::MessageRecord;

/// Routes one line received from `session`.
///
/// Blank lines are dropped. `!w <user> <message>` whispers, anything else
/// is broadcast to every live session including the sender.
pub async fn route_line(state: &ChatState, session: &Session, line: &str) {
    match command::parse(line) {
        None => {
            tracing::trace!(conn_id = %session.conn_id, "dropping blank line");
        }
        Some(ChatCommand::Broadcast { body }) => broadcast_message(state, session, body).await,
        Some(ChatCommand::Whisper { target, body }) => {
            whisper(state, session, target, body).await;
        }
    }
}

async fn broadcast_message(state: &ChatState, session: &Session, body: &str) {
    persist(state, &MessageRecord::public(&session.username, body));
    let frame = ServerFrame::chat(&session.username, body);
    let delivered = broadcast(state, &frame, None).await;
    tracing::debug!(sender = %session.username, delivered, "broadcast routed");
}

async fn whisper(state: &ChatState, session: &Session, target: &str, body: &str) {
    let Some(recipient) = state.sessions.find_by_username(target).await else {
        tracing::debug!(sender = %session.username, target = %target, "whisper target not online");
        reply(
            state,
            session,
            &ServerFrame::NotOnline {
                target: target.to_string(),
            },
        )
        .await;
        return;
    };

    persist(
        state,
        &MessageRecord::private(&session.username, body, &recipient.username),
    );
    let frame = ServerFrame::whisper(&session.username, body);
    recipient.deliver(&frame.to_string());
    if recipient.conn_id != session.conn_id {
        reply(state, session, &frame).await;
    }
    tracing::debug!(sender = %session.username, target = %recipient.username, "whisper routed");
}

/// Sends a frame back to the session's own connection.
async fn reply(state: &ChatState, session: &Session, frame: &ServerFrame) {
    if let Some(me) = state.sessions.get(session.conn_id).await {
        me.deliver(&frame.to_string());
    }
}

/// Delivers `frame` to every live session except `except`.
///
/// Returns how many connections accepted the frame. A connection that is
/// no longer writable is skipped without affecting the others.
pub async fn broadcast(state: &ChatState, frame: &ServerFrame, except: Option<ConnectionId>) -> usize {
    let text = frame.to_string();
    state
        .sessions
        .snapshot()
        .await
        .iter()
        .filter(|r| Some(r.conn_id) != except)
        .filter(|r| r.deliver(&text))
        .count()
}

fn persist(state: &ChatState, record: &MessageRecord) {
    if let Err(e) = state.messages.append(record) {
        tracing::warn!(sender = %record.sender, error = %e, "failed to log message, delivering anyway");
    }
}
