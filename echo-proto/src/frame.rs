//! Server-to-client text frames.
//!
//! Every frame the server sends is a single line of human-readable text.
//! Presentation clients match on the substrings produced here (`said:`,
//! `privately said:`, `has joined`, `has left`, the `ERROR:` prefix), so the
//! rendering in [`ServerFrame`]'s `Display` impl is the wire contract.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};

/// Prefix of every handshake rejection frame.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Local timestamp layout, e.g. `17/1/2026, 10:03:56 pm`.
const TIMESTAMP_FORMAT: &str = "%-d/%-m/%Y, %-I:%M:%S %P";

const WELCOME_PREFIX: &str = "Welcome to Echo, ";
const WELCOME_SUFFIX: &str = "!";
const SAID: &str = " said: ";
const PRIVATELY: &str = " privately";
const JOINED_SUFFIX: &str = " has joined";
const LEFT_SUFFIX: &str = " has left";
const NOT_ONLINE_PREFIX: &str = "User ";
const NOT_ONLINE_SUFFIX: &str = " is not online";
const SHUTDOWN_NOTICE: &str = "Server is shutting down, goodbye";

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// First frame was not a usable `{username, password}` payload.
    BadCredentialsFormat,
    /// The username already has a live session.
    AlreadyOnline,
    /// The password does not match the stored hash.
    WrongPassword,
    /// No credentials arrived within the handshake timeout.
    HandshakeTimeout,
    /// The server is shutting down and accepts no new sessions.
    ShuttingDown,
    /// Persistence or hashing failed on the server.
    Unavailable,
}

impl RejectReason {
    const ALL: [Self; 6] = [
        Self::BadCredentialsFormat,
        Self::AlreadyOnline,
        Self::WrongPassword,
        Self::HandshakeTimeout,
        Self::ShuttingDown,
        Self::Unavailable,
    ];

    /// The reason text carried after the `ERROR:` prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadCredentialsFormat => "invalid credentials format",
            Self::AlreadyOnline => "user is already online",
            Self::WrongPassword => "wrong password",
            Self::HandshakeTimeout => "handshake timed out",
            Self::ShuttingDown => "server is shutting down",
            Self::Unavailable => "service unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reject reason: {0}")]
pub struct UnknownReason(pub String);

impl FromStr for RejectReason {
    type Err = UnknownReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownReason(s.to_string()))
    }
}

/// A frame sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// First frame of an authenticated session.
    Welcome {
        /// The authenticated username.
        username: String,
    },
    /// Handshake refused; the connection closes right after.
    Rejected(RejectReason),
    /// A public message.
    Chat {
        /// Rendered with [`format_timestamp`].
        timestamp: String,
        /// Author of the message.
        sender: String,
        /// Message text.
        body: String,
    },
    /// A private message, seen only by sender and target.
    Whisper {
        /// Rendered with [`format_timestamp`].
        timestamp: String,
        /// Author of the message.
        sender: String,
        /// Message text.
        body: String,
    },
    /// Another user authenticated.
    Joined {
        /// Who joined.
        username: String,
    },
    /// A user's session ended.
    Left {
        /// Who left.
        username: String,
    },
    /// A whisper target has no live session.
    NotOnline {
        /// The target as the sender typed it.
        target: String,
    },
    /// The server is about to close every connection.
    ShuttingDown,
}

impl ServerFrame {
    /// Builds a public chat frame stamped with the current local time.
    #[must_use]
    pub fn chat(sender: &str, body: &str) -> Self {
        Self::Chat {
            timestamp: now_timestamp(),
            sender: sender.to_string(),
            body: body.to_string(),
        }
    }

    /// Builds a whisper frame stamped with the current local time.
    #[must_use]
    pub fn whisper(sender: &str, body: &str) -> Self {
        Self::Whisper {
            timestamp: now_timestamp(),
            sender: sender.to_string(),
            body: body.to_string(),
        }
    }

    /// Recognizes a frame produced by this module's `Display` impl.
    ///
    /// Returns `None` for text that matches no frame shape.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(reason) = text.strip_prefix(ERROR_PREFIX) {
            return reason.parse().ok().map(Self::Rejected);
        }
        if let Some(username) = text
            .strip_prefix(WELCOME_PREFIX)
            .and_then(|rest| rest.strip_suffix(WELCOME_SUFFIX))
            .filter(|u| is_username_token(u))
        {
            return Some(Self::Welcome {
                username: username.to_string(),
            });
        }
        if let Some(frame) = parse_message(text) {
            return Some(frame);
        }
        if let Some(username) = text
            .strip_suffix(JOINED_SUFFIX)
            .filter(|u| is_username_token(u))
        {
            return Some(Self::Joined {
                username: username.to_string(),
            });
        }
        if let Some(username) = text.strip_suffix(LEFT_SUFFIX).filter(|u| is_username_token(u)) {
            return Some(Self::Left {
                username: username.to_string(),
            });
        }
        if let Some(target) = text
            .strip_prefix(NOT_ONLINE_PREFIX)
            .and_then(|rest| rest.strip_suffix(NOT_ONLINE_SUFFIX))
            .filter(|t| is_username_token(t))
        {
            return Some(Self::NotOnline {
                target: target.to_string(),
            });
        }
        (text == SHUTDOWN_NOTICE).then_some(Self::ShuttingDown)
    }
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome { username } => write!(f, "{WELCOME_PREFIX}{username}{WELCOME_SUFFIX}"),
            Self::Rejected(reason) => write!(f, "{ERROR_PREFIX}{reason}"),
            Self::Chat {
                timestamp,
                sender,
                body,
            } => write!(f, "{timestamp}: {sender}{SAID}{body}"),
            Self::Whisper {
                timestamp,
                sender,
                body,
            } => write!(f, "{timestamp}: {sender}{PRIVATELY}{SAID}{body}"),
            Self::Joined { username } => write!(f, "{username}{JOINED_SUFFIX}"),
            Self::Left { username } => write!(f, "{username}{LEFT_SUFFIX}"),
            Self::NotOnline { target } => {
                write!(f, "{NOT_ONLINE_PREFIX}{target}{NOT_ONLINE_SUFFIX}")
            }
            Self::ShuttingDown => f.write_str(SHUTDOWN_NOTICE),
        }
    }
}

/// Parses `<timestamp>: <sender>[ privately] said: <body>`.
///
/// Usernames never contain whitespace, so the first ` said: ` always ends
/// the header even when the body repeats it.
fn parse_message(text: &str) -> Option<ServerFrame> {
    let (header, body) = text.split_once(SAID)?;
    let (header, private) = match header.strip_suffix(PRIVATELY) {
        Some(h) => (h, true),
        None => (header, false),
    };
    let (timestamp, sender) = header.rsplit_once(": ")?;
    if timestamp.is_empty() || !is_username_token(sender) {
        return None;
    }
    let (timestamp, sender, body) = (timestamp.to_string(), sender.to_string(), body.to_string());
    Some(if private {
        ServerFrame::Whisper {
            timestamp,
            sender,
            body,
        }
    } else {
        ServerFrame::Chat {
            timestamp,
            sender,
            body,
        }
    })
}

fn is_username_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

/// Renders a timestamp in the layout chat frames use.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// The current local time rendered with [`format_timestamp`].
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(&Local::now())
}
