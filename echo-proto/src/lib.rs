//! Shared wire protocol for the Echo chat server.
//!
//! Clients speak plain text frames over a WebSocket: one JSON credentials
//! frame to authenticate, then chat lines. The server answers with the
//! human-readable frames defined in [`frame`].

pub mod command;
pub mod credentials;
pub mod frame;

pub use command::ChatCommand;
pub use credentials::{Credentials, CredentialsError};
pub use frame::{RejectReason, ServerFrame};
