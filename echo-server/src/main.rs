//! Echo chat server.
//!
//! An axum WebSocket server that authenticates each connection with a
//! one-shot username/password frame and then routes chat lines between the
//! connected users.
//!
//! # Usage
//!
//! ```bash
//! # Run on the default address 0.0.0.0:8080
//! cargo run --bin echo-server
//!
//! # Custom port and database
//! cargo run --bin echo-server -- --port 9000 --database ./echo.db
//!
//! # Or via environment variables
//! PORT=9000 ECHO_DATABASE=./echo.db cargo run --bin echo-server
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use echo_server::config::{ServerCliArgs, ServerConfig};
use echo_server::hashing::CredentialHasher;
use echo_server::server::{self, ChatState};
use echo_server::sqlite::SqliteStore;
use echo_server::store::CredentialStore;
use tokio::sync::oneshot;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open database");
            std::process::exit(1);
        }
    };

    // No session survives a restart.
    match store.reset_all_offline() {
        Ok(0) => {}
        Ok(cleared) => tracing::info!(cleared, "cleared stale online flags"),
        Err(e) => {
            tracing::error!(error = %e, "failed to reset online flags");
            std::process::exit(1);
        }
    }

    let hasher = match CredentialHasher::new(config.hash_cost) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "invalid password hash configuration");
            std::process::exit(1);
        }
    };

    let state = Arc::new(
        ChatState::new(store, hasher)
            .with_handshake_timeout(config.handshake_timeout)
            .with_max_frame_size(config.max_frame_size),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let signal = async move {
        let _ = shutdown_rx.await;
    };

    let addr = config.bind_addr();
    let (bound_addr, mut handle) =
        match server::start_server_with_shutdown(&addr, Arc::clone(&state), signal).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "failed to start server");
                std::process::exit(1);
            }
        };
    tracing::info!(addr = %bound_addr, "echo server listening");

    tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        result = &mut handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server task failed");
            }
            return;
        }
    }

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(config.shutdown_grace, &mut handle)
        .await
        .is_err()
    {
        tracing::warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            connections = state.open_connections(),
            "connections still open after grace period, aborting"
        );
        handle.abort();
    }
    tracing::info!("echo server stopped");
}

/// Install the tracing subscriber.
///
/// With a `file_path`, output goes through a non-blocking file writer and
/// the returned [`WorkerGuard`] must be held until exit so buffered entries
/// are flushed. Otherwise logs go to stdout.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(|p| {
        let dir = p.parent().filter(|d| !d.as_os_str().is_empty());
        Some((dir.unwrap_or_else(|| Path::new(".")), p.file_name()?))
    }) else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
