//! tandemd: HA daemon for one controller of a Tandem storage pair.
//!
//! # Quick Start
//!
//! ```bash
//! # Run the daemon (systemd unit)
//! tandemd serve
//!
//! # keepalived notify script
//! tandemd event eth0 MASTER
//!
//! # Inspect the local role
//! tandemd status
//! ```

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tandem_config::{ConfigLoader, TandemConfig};
use tandem_node::daemon;
use tracing_subscriber::EnvFilter;

/// Tandem HA daemon.
#[derive(Parser)]
#[command(name = "tandemd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory searched for tandem.toml and tandem.local.toml.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the failover daemon until interrupted.
    Serve,

    /// Show the HA status of the local controller.
    Status {
        /// Output format (text, json).
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Report a keepalived state change to the running daemon.
    Event {
        /// Failover interface the state change is for.
        interface: String,

        /// MASTER, BACKUP, FAULT or FORCE_TAKEOVER.
        state: String,
    },

    /// Show the effective configuration.
    Config {
        /// Output format (toml, json).
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

/// Loads, path-resolves and validates the configuration.
fn load_config(dir: &Path) -> Result<TandemConfig> {
    ConfigLoader::new()
        .with_project_dir(dir)
        .load()
        .context("Failed to load configuration")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config_dir)?;

    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::default().add_directive(tracing::Level::INFO.into()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve => daemon::run(&config),
        Commands::Status { format } => commands::status::run(&config, &format),
        Commands::Event { interface, state } => commands::event::run(&config, &interface, &state),
        Commands::Config { format } => commands::config::show(&config, &format),
    }
}
