//! wal2csv - PostgreSQL CDC egress to compressed CSV files
//!
//! Streams a logical replication slot into per-table gzip CSV batches on a
//! file store, coordinates full-table reloads through in-WAL markers, and
//! indexes every produced file in a registry inside the source database.

mod batch;
mod change_buffer;
mod config;
mod dispatch;
mod errors;
mod export;
mod lsn;
mod model;
mod pipeline;
mod protocol;
mod registry;
mod reload;
mod replication;
mod startup;
mod util;
mod writer;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;
use crate::startup::AdminClient;

#[derive(Parser, Debug)]
#[command(
    name = "wal2csv",
    about = "PostgreSQL CDC egress service producing compressed CSV batches",
    version = "0.1.0"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Drop the replication slot and truncate registry state, then exit.
    /// Refused while another instance holds the slot.
    #[arg(long)]
    drop_slot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        slot = %config.replication.slot_name,
        publication = %config.replication.publication_name,
        base_path = %config.output.base_path.display(),
        "starting wal2csv"
    );

    if args.drop_slot {
        let admin = match AdminClient::connect(config.sql_dsn()).await {
            Ok(admin) => admin,
            Err(e) => {
                error!("cannot connect to source: {e}");
                std::process::exit(e.exit_code());
            }
        };
        match admin
            .drop_slot_and_reset(&config.replication.slot_name, &config.registry.schema)
            .await
        {
            Ok(()) => {
                info!("slot dropped and registry reset");
                return Ok(());
            }
            Err(e) => {
                error!("drop-slot failed: {e}");
                std::process::exit(e.exit_code());
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(true);
    });

    match pipeline::run(config, shutdown_rx).await {
        Ok(()) => {
            info!("wal2csv stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!("wal2csv failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
