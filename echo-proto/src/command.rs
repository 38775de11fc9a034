//! Chat-line grammar for frames sent after authentication.
//!
//! A line is either a whisper command or a public message:
//!
//! ```text
//! whisper   = ("!whisper" | "!w") ws+ target ws+ body
//! target    = non-whitespace+
//! body      = any non-empty remainder
//! ```
//!
//! The command word is matched ASCII case-insensitively. A line that starts
//! like a command but does not match the full grammar (e.g. `!w bob` with no
//! body) is an ordinary public message.

/// Command words that introduce a whisper.
const WHISPER_COMMANDS: [&str; 2] = ["!whisper", "!w"];

/// A classified chat line, borrowing from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand<'a> {
    /// Deliver `body` to every online session.
    Broadcast {
        /// The trimmed line.
        body: &'a str,
    },
    /// Deliver `body` privately to `target` (and echo it to the sender).
    Whisper {
        /// Username of the recipient, as typed.
        target: &'a str,
        /// Message text, verbatim apart from the surrounding whitespace.
        body: &'a str,
    },
}

/// Classifies a raw chat line.
///
/// Returns `None` for lines that are empty after trimming.
#[must_use]
pub fn parse(line: &str) -> Option<ChatCommand<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(parse_whisper(line).unwrap_or(ChatCommand::Broadcast { body: line }))
}

fn parse_whisper(line: &str) -> Option<ChatCommand<'_>> {
    let (command, rest) = split_token(line)?;
    if !WHISPER_COMMANDS
        .iter()
        .any(|c| command.eq_ignore_ascii_case(c))
    {
        return None;
    }
    let (target, body) = split_token(rest.trim_start())?;
    let body = body.trim_start();
    if target.is_empty() || body.is_empty() {
        return None;
    }
    Some(ChatCommand::Whisper { target, body })
}

/// Splits off the first whitespace-delimited token.
///
/// Returns `None` when there is no whitespace after the token, since every
/// grammar position that uses this must be followed by more input.
fn split_token(s: &str) -> Option<(&str, &str)> {
    let idx = s.find(char::is_whitespace)?;
    Some((&s[..idx], &s[idx..]))
}
