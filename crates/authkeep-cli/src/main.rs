//! authkeep - inspect and drive a stored API session from the terminal.
//!
//! Every command builds the same services a UI would: it opens the
//! configured credential storage, resolves the startup session state, and
//! then acts on it.

mod commands;

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use authkeep_core::{Config, HttpAuthBackend, SessionManager, TokenManager};
use commands::Command;

/// Directory for rolling log files, in addition to stderr
const LOG_DIR_ENV: &str = "AUTHKEEP_LOG_DIR";

/// Initialize the tracing subscriber for logging.
///
/// Returns the file writer guard when file logging is enabled; it must live
/// until exit so buffered lines get flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g., RUST_LOG=authkeep_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "authkeep.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let command = match Command::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n", e);
            eprintln!("{}", commands::USAGE);
            return Ok(ExitCode::from(2));
        }
    };
    if command == Command::Help {
        println!("{}", commands::USAGE);
        return Ok(ExitCode::SUCCESS);
    }

    let _log_guard = init_tracing();

    let mut config = Config::load()?;
    config.apply_env_overrides()?;
    info!(api = %config.api_base_url, storage = ?config.storage, "authkeep starting");

    let session_config = config.session_config();
    let storage = config.open_storage()?;
    let backend = Arc::new(HttpAuthBackend::new(&config.api_base_url)?);
    let tokens = Arc::new(TokenManager::new(
        storage,
        backend.clone(),
        session_config.refresh_timeout,
    ));
    let session = Arc::new(SessionManager::new(tokens, backend, session_config));

    let status = commands::run(command, session).await?;
    Ok(ExitCode::from(status))
}
