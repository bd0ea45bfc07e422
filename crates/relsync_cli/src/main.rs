//! relsync CLI
//!
//! Runs the sync engine from a configuration file and inspects its ledger.
//!
//! # Commands
//!
//! - `run` - Start every configured pair, peer channel and listener
//! - `check` - Validate a configuration file without starting anything
//! - `sessions` - List recent sync sessions from a ledger
//! - `events` - List recent ledger events

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// relsync multi-store sync engine.
#[derive(Parser)]
#[command(name = "relsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and run until interrupted
    Run {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate a configuration file
    Check {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List recent sync sessions
    Sessions {
        /// Ledger URL (sqlite://...)
        #[arg(short, long)]
        ledger: String,

        /// Maximum number of sessions to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List recent ledger events
    Events {
        /// Ledger URL (sqlite://...)
        #[arg(short, long)]
        ledger: String,

        /// Maximum number of events to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Only show events of this kind (e.g. sync_error)
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { config } => {
            commands::run::run(&config).await?;
        }
        Commands::Check { config, format } => {
            commands::check::run(&config, &format)?;
        }
        Commands::Sessions {
            ledger,
            limit,
            format,
        } => {
            commands::sessions::run(&ledger, limit, &format).await?;
        }
        Commands::Events {
            ledger,
            limit,
            kind,
        } => {
            commands::events::run(&ledger, limit, kind.as_deref()).await?;
        }
        Commands::Version => {
            println!("relsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
