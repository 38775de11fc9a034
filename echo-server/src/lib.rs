//! Echo chat server library.
//!
//! Exposes the session manager for use in tests and embedding. The server
//! accepts WebSocket connections, authenticates each one with a single
//! credentials frame (registering unknown usernames on first use), and then
//! routes public and private chat lines between the live sessions.

pub mod auth;
pub mod config;
pub mod hashing;
pub mod router;
pub mod server;
pub mod sessions;
pub mod sqlite;
pub mod store;
