//! Share index daemon
//!
//! Keeps the share cache and repository current by rescanning on an interval, and logs
//! every cache refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use shareindex::{Config, ShareService};

const MIN_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

fn load_config() -> Option<Config> {
    let Some(path) = Config::locate() else {
        warn!("No configuration directory, sharing nothing");
        return Some(Config::default());
    };

    if !path.exists() {
        warn!("No configuration at {}, sharing nothing", path.display());
        return Some(Config::default());
    }

    match Config::load(&path) {
        Ok(config) => {
            info!("Loaded configuration from {}", path.display());
            Some(config)
        }
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shareindex=info,shareindex_daemon=info")),
        )
        .init();

    info!("Share index daemon starting...");

    let Some(config) = load_config() else {
        return;
    };

    let service = match ShareService::open(&config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to open share repository: {}", e);
            return;
        }
    };

    // Refresh notifications
    let mut refreshes = service.cache().subscribe();
    tokio::spawn(async move {
        loop {
            match refreshes.recv().await {
                Ok(event) => info!(
                    "Shares refreshed: {} directories, {} files (generation {})",
                    event.directories, event.files, event.generation
                ),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} refresh notifications", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // First tick fires immediately, so this also performs the startup scan
    let mut ticker = tokio::time::interval(config.rescan_interval().max(MIN_RESCAN_INTERVAL));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let service = service.clone();
                match tokio::task::spawn_blocking(move || service.rescan()).await {
                    Ok(Ok(summary)) => debug!(
                        generation = summary.generation,
                        warnings = summary.warnings.len(),
                        "Rescan finished"
                    ),
                    Ok(Err(e)) => error!("Rescan failed: {}", e),
                    Err(e) => error!("Rescan task panicked: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
}
