//! Property-based tests for the chat-line grammar and server frames.
//!
//! Uses proptest to verify:
//! 1. `command::parse` never panics and only drops blank lines.
//! 2. Lines not starting with `!` are always broadcast, trimmed.
//! 3. Well-formed whispers parse to their target and body, for either
//!    command word in any ASCII case.
//! 4. Chat and whisper frames are recognized by `ServerFrame::parse`.
//! 5. Arbitrary text never panics `ServerFrame::parse` or credential decoding.

use echo_proto::command::{self, ChatCommand};
use echo_proto::frame::{self, ServerFrame};
use echo_proto::{Credentials, RejectReason};
use proptest::prelude::*;

/// Usernames as the server accepts them: non-empty, no whitespace.
fn arb_username() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.-]{1,32}"
}

/// Message bodies with no leading or trailing whitespace.
fn arb_body() -> impl Strategy<Value = String> {
    "[^\\s](.{0,60}[^\\s])?"
}

/// `!w` or `!whisper` in random ASCII case.
fn arb_whisper_word() -> impl Strategy<Value = String> {
    (prop_oneof![Just("!w"), Just("!whisper")], any::<u64>()).prop_map(|(word, mask)| {
        word.chars()
            .enumerate()
            .map(|(i, c)| {
                if (mask >> (i % 64)) & 1 == 1 {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            })
            .collect()
    })
}

fn arb_gap() -> impl Strategy<Value = String> {
    "[ \t]{1,3}"
}

proptest! {
    #[test]
    fn parse_never_panics(line in ".*") {
        let parsed = command::parse(&line);
        prop_assert_eq!(parsed.is_none(), line.trim().is_empty());
    }

    #[test]
    fn non_command_lines_are_broadcast(body in "[^!\\s].{0,80}", pad in "[ \t]{0,3}") {
        let line = format!("{pad}{body}{pad}");
        prop_assert_eq!(
            command::parse(&line),
            Some(ChatCommand::Broadcast { body: line.trim() })
        );
    }

    #[test]
    fn whispers_parse(
        word in arb_whisper_word(),
        target in arb_username(),
        body in arb_body(),
        gap1 in arb_gap(),
        gap2 in arb_gap(),
    ) {
        let line = format!("{word}{gap1}{target}{gap2}{body}");
        prop_assert_eq!(
            command::parse(&line),
            Some(ChatCommand::Whisper { target: &target, body: &body })
        );
    }

    #[test]
    fn whisper_without_body_is_broadcast(word in arb_whisper_word(), target in arb_username()) {
        let line = format!("{word} {target}");
        prop_assert_eq!(
            command::parse(&line),
            Some(ChatCommand::Broadcast { body: line.as_str() })
        );
    }

    #[test]
    fn chat_frames_are_recognized(sender in arb_username(), body in arb_body()) {
        let frame = ServerFrame::chat(&sender, &body);
        prop_assert_eq!(ServerFrame::parse(&frame.to_string()), Some(frame));
    }

    #[test]
    fn whisper_frames_are_recognized(sender in arb_username(), body in arb_body()) {
        let frame = ServerFrame::whisper(&sender, &body);
        let text = frame.to_string();
        prop_assert!(text.contains(" privately said: "));
        prop_assert_eq!(ServerFrame::parse(&text), Some(frame));
    }

    #[test]
    fn presence_frames_are_recognized(username in arb_username()) {
        for frame in [
            ServerFrame::Welcome { username: username.clone() },
            ServerFrame::Joined { username: username.clone() },
            ServerFrame::Left { username: username.clone() },
            ServerFrame::NotOnline { target: username.clone() },
        ] {
            prop_assert_eq!(ServerFrame::parse(&frame.to_string()), Some(frame));
        }
    }

    #[test]
    fn frame_parse_never_panics(text in ".*") {
        let _ = ServerFrame::parse(&text);
    }

    #[test]
    fn credential_decoding_never_panics(text in ".*") {
        let _ = Credentials::from_json(&text);
    }

    #[test]
    fn decoded_credentials_are_valid(username in arb_username(), password in "[A-Za-z0-9 !#$%&()*+,./:;<=>?@^_`{|}~-]{1,64}") {
        let json = format!(r#"{{"username":"{username}","password":"{password}"}}"#);
        let creds = Credentials::from_json(&json);
        prop_assert!(creds.is_ok());
        let creds = creds.unwrap_or_else(|_| unreachable!());
        prop_assert_eq!(creds.username, username);
        prop_assert_eq!(creds.password, password);
    }
}

#[test]
fn every_reject_reason_renders_with_error_prefix() {
    for reason in [
        RejectReason::BadCredentialsFormat,
        RejectReason::AlreadyOnline,
        RejectReason::WrongPassword,
        RejectReason::HandshakeTimeout,
        RejectReason::ShuttingDown,
        RejectReason::Unavailable,
    ] {
        let text = ServerFrame::Rejected(reason).to_string();
        assert!(text.starts_with(frame::ERROR_PREFIX));
        assert_eq!(ServerFrame::parse(&text), Some(ServerFrame::Rejected(reason)));
    }
}
