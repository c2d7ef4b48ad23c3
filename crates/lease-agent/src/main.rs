mod config;
mod store;

use std::time::Duration;

use clap::Parser;
use lease_core::{LeaseEvent, LeaseHandle, LeaseManager};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use store::{open_store, StoreUrl};

/// Time given to the worker to delete released rows before stopping.
const RELEASE_DRAIN: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let lease_config = config.lease_config();

    info!("Starting lease-agent");
    if let Some(url) = config.store_url.as_deref().and_then(|u| StoreUrl::parse(u).ok()) {
        info!("  Store: {}", url);
    }
    info!("  Lease duration: {:?}", lease_config.lease_duration);
    info!("  Leases enabled: {}", lease_config.enabled);

    let store = open_store(&config).await?;
    let manager = LeaseManager::new(store.clone(), lease_config);
    info!("  Owner id: {}", manager.owner_id());

    if let Err(e) = manager.start().await {
        error!("Failed to start lease manager on {} store: {}", store.name(), e);
        return Err(e.into());
    }

    let mut handles = Vec::with_capacity(config.leases.len());
    for name in &config.leases {
        let handle = manager.create(name.clone(), |event: &LeaseEvent| {
            info!("Lease {} is now {}", event.name, event.state);
        })?;
        handles.push(handle);
    }
    info!("Holding {} lease(s)", handles.len());

    let mut shutdown_rx = create_shutdown_signal();
    match config.report_interval() {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|&v| v) => break,
                    _ = ticker.tick() => report(&manager, &handles).await,
                }
            }
        }
        None => {
            let _ = shutdown_rx.wait_for(|&v| v).await;
        }
    }

    for handle in &handles {
        handle.release();
    }
    tokio::time::sleep(RELEASE_DRAIN).await;
    manager.stop();

    info!("Lease agent shutdown complete");
    Ok(())
}

/// Log the leases held here and the full table as seen by the store.
async fn report(manager: &LeaseManager, handles: &[LeaseHandle]) {
    let held: Vec<&str> = handles
        .iter()
        .filter(|h| h.is_acquired())
        .map(|h| h.name())
        .collect();

    match manager.all_leases().await {
        Ok(all) => {
            let table = serde_json::to_string(&all).unwrap_or_default();
            info!(held = ?held, "Lease table: {}", table);
        }
        Err(e) => warn!(held = ?held, "Failed to read lease table: {}", e),
    }
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
