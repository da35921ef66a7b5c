//! SR-IOV FEC node daemon
//!
//! Runs on every node with FEC accelerators. Watches the node's own
//! SriovFecNodeConfig and drives the accelerators towards the declared
//! layout:
//! - Bootstraps an empty record for the node on startup
//! - Reconciles on every record change and on a periodic resync
//! - Reports the applied layout and conditions back into the record status

mod backoff;
mod bootstrap;
mod config;
mod controller;
mod error;
mod metrics;
mod probes;
mod reconciler;
mod store;
mod watcher;
mod work_queue;

#[cfg(test)]
mod test_utils;

use crate::config::DaemonConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting SR-IOV FEC daemon");

    // Load configuration from environment variables
    let config = DaemonConfig::from_env().inspect_err(|e| error!("{}", e))?;

    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Namespace: {}", config.namespace);
    info!("  Resync interval: {:?}", config.resync_interval);
    info!("  Backoff: {:?} to {:?}", config.backoff_min, config.backoff_max);
    info!("  Sysfs root: {}", config.sysfs_root.display());
    info!("  Firmware dir: {}", config.firmware_dir.display());
    match config.probe_bind_address {
        Some(addr) => info!("  Probes: {}", addr),
        None => info!("  Probes: disabled"),
    }

    // kube's rustls-tls needs a process-wide crypto provider; ignore "already installed"
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
