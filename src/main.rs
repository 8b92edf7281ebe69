//! # Corpus Harness CLI (`corpus`)
//!
//! The `corpus` binary initializes the data directory and runs the MCP
//! server over stdio.
//!
//! ## Usage
//!
//! ```bash
//! corpus --config ./config/corpus.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus init` | Create the data directory, the SQLite metadata store, and run schema migrations |
//! | `corpus serve` | Start the MCP server on stdin/stdout |
//!
//! The config file is optional; a missing file yields defaults rooted at
//! `./corpus-data`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use corpus_harness::config::{load_config, ServerConfig};
use corpus_harness::Engine;

/// Corpus Harness — session-scoped retrieval and provenance engine for
/// recursive language model workflows.
#[derive(Parser)]
#[command(
    name = "corpus",
    about = "Session-scoped retrieval and provenance engine for recursive language model workflows",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). A missing file yields defaults.
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database schema.
    ///
    /// Creates the metadata store, blob, and index subtrees and replays
    /// pending migrations. Idempotent.
    Init,

    /// Run the MCP server over stdin/stdout.
    ///
    /// Tool calls arrive as JSON-RPC requests; logs go to stderr (or the
    /// configured log file) so stdout stays a clean protocol channel.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: ServerConfig = load_config(&cli.config)?;

    // Hold the file-writer guard for the process lifetime.
    let _log_guard = corpus_harness::logging::init(&config)?;

    match cli.command {
        Commands::Init => {
            let engine = Engine::new(config).await?;
            println!(
                "initialized data directory at {}",
                engine.config().data_dir.display()
            );
            Ok(())
        }
        Commands::Serve => {
            let engine = Arc::new(Engine::new(config).await?);
            corpus_harness::mcp::run_stdio(engine).await
        }
    }
}
