//! Configuration system for the Echo chat server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/echo-chat/config.toml`)
//! 4. Compiled defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hashing::HashCost;
use crate::server::DEFAULT_MAX_FRAME_SIZE;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// No database path was given and no data directory could be found.
    #[error("no database path configured and no platform data directory available")]
    NoDatabasePath,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
    storage: StorageFileConfig,
    auth: AuthFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    host: Option<String>,
    port: Option<u16>,
    handshake_timeout_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    max_frame_size: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    database_path: Option<PathBuf>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    hash_memory_kib: Option<u32>,
    hash_iterations: Option<u32>,
    hash_parallelism: Option<u32>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the chat server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Echo chat server")]
pub struct ServerCliArgs {
    /// Host address to listen on.
    #[arg(long, env = "ECHO_HOST")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Path to config file (default: `~/.config/echo-chat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite database.
    #[arg(short, long, env = "ECHO_DATABASE")]
    pub database: Option<PathBuf>,

    /// Seconds a new connection may take to send credentials (0 disables).
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Seconds to wait for connections to close on shutdown.
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "ECHO_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Time allowed for the credentials frame. `None` disables the limit.
    pub handshake_timeout: Option<Duration>,
    /// Bound on the wait for connections to close on shutdown.
    pub shutdown_grace: Duration,
    /// Largest inbound WebSocket message in bytes.
    pub max_frame_size: usize,
    /// Argon2 cost for newly registered passwords.
    pub hash_cost: HashCost,
    /// Log level filter string.
    pub log_level: String,
    /// Optional log file.
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Default handshake timeout in seconds.
    pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
    /// Default shutdown grace in seconds.
    pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if no database path can be determined.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file, default_database_path())
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(
        cli: &ServerCliArgs,
        file: &ServerConfigFile,
        default_database: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let server = &file.server;
        let auth = &file.auth;
        let default_cost = HashCost::default();

        let database_path = cli
            .database
            .clone()
            .or_else(|| file.storage.database_path.clone())
            .or(default_database)
            .ok_or(ConfigError::NoDatabasePath)?;

        let handshake_secs = cli
            .handshake_timeout_secs
            .or(server.handshake_timeout_secs)
            .unwrap_or(Self::DEFAULT_HANDSHAKE_TIMEOUT_SECS);

        Ok(Self {
            host: cli
                .host
                .clone()
                .or_else(|| server.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: cli.port.or(server.port).unwrap_or(8080),
            database_path,
            handshake_timeout: (handshake_secs > 0).then(|| Duration::from_secs(handshake_secs)),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace_secs
                    .or(server.shutdown_grace_secs)
                    .unwrap_or(Self::DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            max_frame_size: server.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
            hash_cost: HashCost {
                memory_kib: auth.hash_memory_kib.unwrap_or(default_cost.memory_kib),
                iterations: auth.hash_iterations.unwrap_or(default_cost.iterations),
                parallelism: auth.hash_parallelism.unwrap_or(default_cost.parallelism),
            },
            log_level: cli.log_level.clone(),
            log_file: cli.log_file.clone(),
        })
    }

    /// The `host:port` string to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("echo-chat").join("echo.db"))
}

/// Load and parse a TOML config file.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("echo-chat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
