//! bhyvisord - bhyve guest supervisor daemon

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use bhyvisor::inventory::StaticInventory;
use bhyvisor::store::JsonFileStore;
use bhyvisor::{telemetry, DaemonConfig, GuestManager, GuestRegistry, ManagerParts};

#[derive(Debug, Parser)]
#[command(name = "bhyvisord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon configuration file (TOML)
    #[arg(long, short, default_value = "/usr/local/etc/bhyvisor.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = if cli.config.exists() {
        DaemonConfig::load(&cli.config)
    } else {
        Ok(DaemonConfig::default())
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bhyvisord: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = telemetry::init_logging(cli.json_logs || config.logging.json, &config.logging.filter) {
        eprintln!("bhyvisord: failed to initialize logging: {}", e);
    }
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "no config file, using defaults");
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "daemon failed");
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> bhyvisor::Result<()> {
    let store = Arc::new(JsonFileStore::new(&config.database_dir)?);
    let registry = Arc::new(GuestRegistry::load(store)?);
    let inventory = Arc::new(StaticInventory::from_config(&config.inventory));
    info!(
        guests = registry.len(),
        state_dir = %config.state_dir.display(),
        "bhyvisord starting"
    );

    let manager = Arc::new(GuestManager::new(ManagerParts::host(&config, registry, inventory)));

    // records left RUNNING by a previous daemon have nothing supervising them
    manager.reconcile().await;
    let autostart = manager.autostart();
    let reconciler = GuestManager::spawn_reconciler(Arc::clone(&manager));

    shutdown_signal().await;
    info!("shutdown requested");

    autostart.abort();
    reconciler.abort();
    manager.shutdown().await;
    info!("bhyvisord stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
