//! Keyratchet store maintenance binary.
//!
//! # Usage
//!
//! ```bash
//! # Collect expired key material once
//! keyratchet --db channels.redb gc
//!
//! # Keep collecting every ten minutes until interrupted
//! keyratchet --db channels.redb gc --interval 600
//!
//! # Report channels and key counts
//! keyratchet --db channels.redb stats
//! ```

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use keyratchet_cli::{CliError, StoreStats, collect_once, run_collector};
use keyratchet_core::{Environment, SystemEnv, storage::RedbStorage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keyratchet store maintenance
#[derive(Parser, Debug)]
#[command(name = "keyratchet")]
#[command(about = "Maintenance for keyratchet channel stores")]
#[command(version)]
struct Args {
    /// Path to the redb channel store
    #[arg(long, default_value = "keyratchet.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete expired key material and drained provisions
    Gc {
        /// Repeat every this many seconds until interrupted
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Report what the store holds
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(db = %args.db.display(), "Opening channel store");
    let storage = RedbStorage::open(&args.db).map_err(CliError::from)?;
    let env = SystemEnv::new();

    match args.command {
        Command::Gc { interval: None } => {
            collect_once(&env, &storage).map_err(CliError::from)?;
        },
        Command::Gc { interval: Some(secs) } => {
            tracing::info!(interval_secs = secs, "Collecting until interrupted");
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %CliError::from(e), "Cannot listen for interrupt");
                }
            };
            run_collector(env, storage, Duration::from_secs(secs.max(1)), shutdown).await;
        },
        Command::Stats => {
            StoreStats::collect(&storage, env.now()).map_err(CliError::from)?.log();
        },
    }

    Ok(())
}
