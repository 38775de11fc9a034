//! Handshake payload sent as the first frame of every connection.
//!
//! The client sends a JSON text frame `{"username": "...", "password": "..."}`.
//! Anything that does not decode, or decodes with an empty or otherwise
//! unusable field, is a malformed payload.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum password length in bytes. Bounds the work done by the hasher.
pub const MAX_PASSWORD_LEN: usize = 1024;

/// Reasons a credentials payload is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    /// The frame is not a JSON object with string `username` and `password`.
    #[error("credentials payload could not be decoded: {0}")]
    Decode(String),
    /// The username field is empty.
    #[error("username is empty")]
    EmptyUsername,
    /// The password field is empty.
    #[error("password is empty")]
    EmptyPassword,
    /// Usernames are single tokens so whisper targets stay unambiguous.
    #[error("username must not contain whitespace")]
    UsernameWhitespace,
    /// The username is longer than [`MAX_USERNAME_LEN`] characters.
    #[error("username exceeds {MAX_USERNAME_LEN} characters")]
    UsernameTooLong,
    /// The password is longer than [`MAX_PASSWORD_LEN`] bytes.
    #[error("password exceeds {MAX_PASSWORD_LEN} bytes")]
    PasswordTooLong,
}

/// A decoded and validated `{username, password}` pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name. Unique case-insensitively on the server.
    pub username: String,
    /// Plaintext password, only ever held long enough to hash or verify.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Creates credentials without validating them.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decodes and validates a handshake frame.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::Decode`] if the text is not a JSON object
    /// with string fields `username` and `password`, or the matching
    /// validation error from [`Credentials::validate`].
    pub fn from_json(text: &str) -> Result<Self, CredentialsError> {
        let creds: Self =
            serde_json::from_str(text).map_err(|e| CredentialsError::Decode(e.to_string()))?;
        creds.validate()?;
        Ok(creds)
    }

    /// Encodes the credentials as the JSON handshake frame.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::Decode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, CredentialsError> {
        serde_json::to_string(self).map_err(|e| CredentialsError::Decode(e.to_string()))
    }

    /// Checks the field rules applied to every handshake.
    ///
    /// # Errors
    ///
    /// Returns the first rule the credentials break.
    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.username.is_empty() {
            return Err(CredentialsError::EmptyUsername);
        }
        if self.password.is_empty() {
            return Err(CredentialsError::EmptyPassword);
        }
        if self.username.chars().any(char::is_whitespace) {
            return Err(CredentialsError::UsernameWhitespace);
        }
        if self.username.chars().count() > MAX_USERNAME_LEN {
            return Err(CredentialsError::UsernameTooLong);
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialsError::PasswordTooLong);
        }
        Ok(())
    }
}
