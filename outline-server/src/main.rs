//! Outline Server - delta sync hub
//!
//! Hosts the card-tree delta channel for outline clients:
//! - Rooms per tree with push acknowledgement and broadcast
//! - Document-list metadata and paged version history
//! - Periodic tombstone compaction
//! - Optional SQLite persistence of cards and history

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outline_core::hlc::Hlc;
use outline_server::hub::{Hub, Retention};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Outline Server Configuration
#[derive(Parser, Debug)]
#[command(name = "outline-server")]
#[command(author = "Outline Sync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Delta sync server for outline card trees", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:7070)
        #[arg(short, long, default_value = "0.0.0.0:7070")]
        addr: String,

        /// Server node id used in HLC timestamps
        #[arg(long, default_value = "server")]
        node: String,

        /// Directory for persisted cards; state is memory only when omitted
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seconds between compaction passes
        #[arg(long, default_value_t = 300)]
        compact_interval: u64,

        /// History snapshots kept per tree
        #[arg(long, default_value_t = 500)]
        max_snapshots: usize,

        /// Prune snapshots older than this many hours
        #[arg(long)]
        snapshot_max_age_hours: Option<u32>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            node,
            data_dir,
            compact_interval,
            max_snapshots,
            snapshot_max_age_hours,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("outline_server=info".parse().context("Invalid log directive")?)
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let retention = Retention {
                max_snapshots,
                max_age_ms: snapshot_max_age_hours.map(|h| i64::from(h) * 3_600_000),
            };
            let hub = match &data_dir {
                Some(dir) => {
                    info!("Card data directory: {:?}", dir);
                    Hub::open(dir, Hlc::new(&node), retention)
                        .with_context(|| format!("Failed to open card data in {:?}", dir))?
                }
                None => Hub::new(&node, retention),
            };
            let hub = Arc::new(hub);

            let addr: SocketAddr = addr.parse().with_context(|| format!("Invalid listen address {}", addr))?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Server listening on {}", addr);
            info!("Compaction every {}s", compact_interval);

            outline_server::spawn_compaction(hub.clone(), Duration::from_secs(compact_interval.max(1)));
            outline_server::serve(listener, hub).await?;
        }
    }

    Ok(())
}
