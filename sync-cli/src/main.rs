//! # trisync
//!
//! Command-line front end for the trisync reconciliation engine.
//!
//! ## Commands
//!
//! - `merge`: Three-way merge of base, local and remote files
//! - `status`: Show the sync status of every persisted document
//! - `validate`: Check the document chart for unresolved references
//!
//! ## Example
//!
//! ```bash
//! # Merge two edits of the same ancestor
//! trisync merge base.md mine.md theirs.md --output merged.md
//!
//! # Inspect persisted documents
//! trisync --state-dir ~/.local/share/trisync status
//!
//! # Verify the chart wiring
//! trisync validate
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{merge, status, validate};
use config::Config;

/// Command-line front end for trisync.
#[derive(Parser, Debug)]
#[command(name = "trisync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State directory holding persisted documents
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Three-way merge of base, local and remote files
    Merge {
        /// Common ancestor
        base: PathBuf,
        /// Local version
        local: PathBuf,
        /// Remote version
        remote: PathBuf,

        /// Write the merged text here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show the sync status of every persisted document
    Status,

    /// Check the document chart for unresolved references
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config, cli.verbose);

    let code = match cli.command {
        Commands::Merge {
            base,
            local,
            remote,
            output,
        } => merge::run(&base, &local, &remote, output.as_deref()).await?,
        Commands::Status => {
            let state_dir = match cli.state_dir.or_else(|| config.storage.state_dir.clone()) {
                Some(dir) => dir,
                None => config::default_state_dir().context("Could not determine home directory")?,
            };
            status::run(&config, &state_dir).await?
        }
        Commands::Validate => validate::run(),
    };

    Ok(code)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.log.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
