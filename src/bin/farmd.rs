//! farmd daemon binary

use clap::{Parser, Subcommand};
use farmd::driver::DryRunDriver;
use farmd::{Farm, FarmConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "farmd")]
#[command(about = "database farm manager: failure detection and failover orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the farm manager
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// State directory (requires the sled-backend feature; in-memory otherwise)
        #[arg(long, default_value = "./farm-data")]
        db: PathBuf,

        /// Worker pool size override
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, db, workers } => {
            let mut cfg = FarmConfig::load(config.as_deref())?;
            if let Some(workers) = workers {
                cfg.executor.workers = workers;
            }

            let store: Arc<dyn farmd::StorageAdapter> = build_store(&db)?;
            // The replication driver is a deployment capability; the stock
            // binary runs with real TCP health checks and logged-only admin
            // operations
            let driver = Arc::new(DryRunDriver::new(Duration::from_millis(
                cfg.detector.ping_timeout_ms,
            )));

            let farm = Farm::new(cfg, store, driver)?;
            farm.serve().await?;
        }
    }

    Ok(())
}

#[cfg(feature = "sled-backend")]
fn build_store(db: &std::path::Path) -> anyhow::Result<Arc<dyn farmd::StorageAdapter>> {
    Ok(Arc::new(farmd::store::SledStore::open(db)?))
}

#[cfg(not(feature = "sled-backend"))]
fn build_store(_db: &std::path::Path) -> anyhow::Result<Arc<dyn farmd::StorageAdapter>> {
    tracing::warn!("sled-backend feature disabled; state will not survive restarts");
    Ok(Arc::new(farmd::MemoryStore::new()))
}
