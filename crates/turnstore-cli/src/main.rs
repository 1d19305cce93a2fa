//! # turnstore-cli
//!
//! Command-line tool for inspecting and maintaining turnstore data.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use turnstore_core::Config;

mod commands;

/// turnstore - session persistence for conversational agents
#[derive(Parser)]
#[command(name = "turnstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory holding sessions.db (overrides configuration)
    #[arg(long, value_name = "DIR", env = "TURNSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session management
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Artifact inspection
    Artifact {
        #[command(subcommand)]
        action: ArtifactAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub(crate) enum SessionAction {
    /// List a user's sessions
    List {
        /// Application name
        app: String,
        /// User ID
        user: String,
    },
    /// Show session details
    Show {
        app: String,
        user: String,
        /// Session ID
        id: String,
        /// Only show the most recent N events
        #[arg(short, long)]
        recent: Option<usize>,
        /// Print the session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a session with its events and artifacts
    Delete { app: String, user: String, id: String },
    /// Revert a session to right before an invocation
    Rewind {
        app: String,
        user: String,
        id: String,
        /// Invocation to rewind before
        #[arg(short, long, value_name = "INVOCATION_ID")]
        before: String,
    },
    /// Check a session and its artifacts for integrity problems
    Check { app: String, user: String, id: String },
    /// Compact old invocations of a session now
    Compact { app: String, user: String, id: String },
}

#[derive(Subcommand)]
pub(crate) enum ArtifactAction {
    /// List artifact filenames visible to a session
    List { app: String, user: String, session: String },
    /// Show an artifact's versions and content
    Show {
        app: String,
        user: String,
        session: String,
        filename: String,
        /// Version to show (latest if omitted)
        #[arg(long)]
        version: Option<u32>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate current configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load configuration
    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Session { action } => {
            commands::session::handle(action, &config).await?;
        }
        Commands::Artifact { action } => {
            commands::artifact::handle(action, &config).await?;
        }
        Commands::Config { action } => {
            commands::config::handle(action, &config)?;
        }
        Commands::Version => {
            println!("turnstore {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
