//! Stencil — template cache synchronization CLI.
//!
//! # Usage
//!
//! ```text
//! stencil sync <path> [--json]
//! stencil cache <path> [--json]
//! stencil daemon start|stop|status
//! stencil daemon sync <path> [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{cache::CacheArgs, daemon::DaemonCommand, sync::SyncArgs};

#[derive(Parser, Debug)]
#[command(
    name = "stencil",
    version,
    about = "Keep local template caches in sync with their catalogs",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synchronize the cache for a template source, printing progress.
    Sync(SyncArgs),

    /// Show what is cached for a template source.
    Cache(CacheArgs),

    /// Run or talk to the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => args.run(),
        Commands::Cache(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
