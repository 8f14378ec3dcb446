//! Stackd control plane entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

mod channel;
mod config;
mod error;
mod intent;
mod lifecycle;
mod placement;
mod reconcile;
mod report;
mod runtime;
mod store;
mod types;
mod worker;

use channel::LocalChannel;
use config::Config;
use lifecycle::Lifecycle;
use reconcile::Reconciler;
use report::LogReporter;
use runtime::DockerConnector;
use store::{MemoryStore, Topology};
use types::Liveness;
use worker::{Provisioner, Settings, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting stackd: sweep every {}s, dead after {}s, runtime port {}",
        cfg.sweep_interval_secs, cfg.dead_threshold_secs, cfg.runtime_port
    );

    // State store
    let topology = match &cfg.topology {
        Some(path) => {
            let topology = Topology::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load topology {}: {}", path.display(), e))?;
            info!(
                "Loaded topology with {} networks and {} nodes",
                topology.networks.len(),
                topology.nodes.len()
            );
            topology
        }
        None => {
            warn!("No topology configured, starting with an empty catalog");
            Topology::default()
        }
    };
    let store = Arc::new(MemoryStore::from_topology(topology));

    // Intent channel and container runtime
    let channel = Arc::new(LocalChannel::new(cfg.redeliver_delay()));
    let connector = Arc::new(DockerConnector::new(cfg.runtime_port, cfg.runtime_timeout_secs));

    // Provisioning worker
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        connector.clone(),
        Arc::new(LogReporter),
        Settings::from_config(&cfg),
    ));
    let worker = Worker::new(provisioner, channel.clone(), cfg.worker_concurrency);
    let (worker_stop_tx, worker_stop_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move {
        if let Err(e) = worker.run(worker_stop_rx).await {
            error!("Provisioning worker failed: {}", e);
        }
    });

    // Reconciliation loop
    let reconciler = Reconciler::new(
        store,
        Lifecycle::new(connector),
        channel,
        Liveness::from_secs(cfg.dead_threshold_secs),
        cfg.sweep_interval(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(stop_rx, worker_stop_tx).await;
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // The reconciler finishes its current network, then stops the worker,
    // which drains its in-flight attempts.
    let _ = stop_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        error!("Reconciliation loop panicked: {}", e);
    }
    if let Err(e) = worker_handle.await {
        error!("Provisioning worker panicked: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}
