//! Logging initialization.
//!
//! Configures the global `tracing` subscriber from server config: threshold
//! from `log_level`, JSON output when `structured_logging` is set, and an
//! optional file sink via `log_file`. Trace-log emission throughout the
//! engine goes through `tracing` macros; the database trace table is separate
//! and always written.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Install the global subscriber. Call once, before the engine starts.
///
/// `RUST_LOG` overrides the configured `log_level` when set. Returns the
/// guard for the non-blocking file writer, which must be held for the
/// process lifetime when a `log_file` is configured.
pub fn init(config: &ServerConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));

    match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);

            if config.structured_logging {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init();
            }
            Ok(Some(guard))
        }
        None => {
            // stdout carries the JSON-RPC channel; logs go to stderr.
            if config.structured_logging {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
            Ok(None)
        }
    }
}
