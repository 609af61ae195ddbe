//! # poster-sync
//!
//! CLI for driving and simulating poster-sync devices.
//!
//! ## Commands
//!
//! - `submit`: Create a request on the originator
//! - `fulfill`: Mark a request fulfilled on the authority
//! - `list`: Show the records on either or both sides
//! - `simulate`: Sync both sides over an in-process loopback link
//!
//! ## Example
//!
//! ```bash
//! # Create two requests on the originator
//! poster-sync submit "A42"
//! poster-sync submit "B7"
//!
//! # Sync both devices, dropping the link once along the way
//! poster-sync simulate --drop-after-ms 1500
//!
//! # Inspect the result
//! poster-sync list --json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use poster_sync_core::Role;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod store;

use commands::{fulfill, list, simulate, submit};
use config::Config;

/// CLI for driving and simulating poster-sync devices.
#[derive(Parser, Debug)]
#[command(name = "poster-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory holding both device stores
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/poster-sync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a request on the originator
    Submit {
        /// What is being requested
        label: String,
    },

    /// Mark a request fulfilled on the authority
    Fulfill {
        /// Request id
        id: String,
    },

    /// Show stored records
    List {
        /// Only show one side
        #[arg(long, value_enum)]
        role: Option<RoleArg>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Sync both sides over a loopback link until they agree
    Simulate {
        /// New requests to create on the originator first
        #[arg(long, default_value = "0")]
        requests: usize,

        /// Sever the link this many milliseconds after start
        #[arg(long)]
        drop_after_ms: Option<u64>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Originator,
    Authority,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Originator => Role::Originator,
            RoleArg::Authority => Role::Authority,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    let config = Config::load(cli.config.as_deref(), &data_dir)?;
    debug!(?config, data_dir = %data_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Submit { label } => {
            submit::run(&config, &data_dir, &label).await?;
        }
        Commands::Fulfill { id } => {
            fulfill::run(&config, &data_dir, &id).await?;
        }
        Commands::List { role, json } => {
            list::run(&config, &data_dir, role.map(Role::from), json).await?;
        }
        Commands::Simulate {
            requests,
            drop_after_ms,
        } => {
            let options = simulate::SimulateOptions {
                requests,
                drop_after: drop_after_ms.map(Duration::from_millis),
            };
            simulate::run(&config, &data_dir, options).await?;
        }
    }

    Ok(())
}

/// Log to stderr so `--json` output stays clean. `RUST_LOG` wins over
/// `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Get the default data directory for poster-sync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "ydun", "poster-sync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
