//! Salted Argon2id password hashing.
//!
//! Hashes are stored as PHC strings, which embed the salt and the cost
//! parameters. Verification always uses the parameters from the stored
//! hash, so raising [`HashCost`] only affects newly registered accounts.

use argon2::password_hash::{self, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use rand_core::OsRng;

/// Errors from hashing or verifying a password.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The configured cost parameters are out of range.
    #[error("invalid hash parameters: {0}")]
    Params(String),
    /// Hashing failed, or a stored hash could not be parsed.
    #[error("password hashing failed: {0}")]
    Hash(String),
    /// The blocking hash task did not complete.
    #[error("password hashing task failed: {0}")]
    Task(String),
}

/// Argon2 cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    /// Memory per hash in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Hashes new passwords and verifies submitted ones.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    /// Creates a hasher using the given cost.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::Params`] if Argon2 rejects the parameters.
    pub fn new(cost: HashCost) -> Result<Self, HashError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| HashError::Params(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hashes a password with a fresh random salt.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::Hash`] if hashing fails.
    pub fn hash(&self, password: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| HashError::Hash(e.to_string()))
    }

    /// Checks a password against a stored PHC hash.
    ///
    /// Returns `Ok(false)` on mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::Hash`] if the stored hash is malformed.
    pub fn verify(&self, password: &str, stored_hash: &str) -> Result<bool, HashError> {
        let parsed = PasswordHash::new(stored_hash).map_err(|e| HashError::Hash(e.to_string()))?;
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Hash(e.to_string())),
        }
    }

    /// [`Self::hash`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if hashing fails or the task is lost.
    pub async fn hash_blocking(&self, password: &str) -> Result<String, HashError> {
        let hasher = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| HashError::Task(e.to_string()))?
    }

    /// [`Self::verify`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if verification fails or the task is lost.
    pub async fn verify_blocking(&self, password: &str, stored_hash: &str) -> Result<bool, HashError> {
        let hasher = self.clone();
        let password = password.to_string();
        let stored_hash = stored_hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &stored_hash))
            .await
            .map_err(|e| HashError::Task(e.to_string()))?
    }
}
