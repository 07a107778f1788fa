//! labfleet Control Plane
//!
//! Drives lab instance requests, hypervisor workers and worker pools toward
//! their desired state and places pending labs on workers.
//!
//! This binary runs against the in-memory store and the mock cloud and
//! hypervisor clients.

use std::sync::Arc;

use anyhow::Result;
use labfleet_control_plane::{
    clients::{MockCloudProvider, MockHypervisor, TracingPublisher},
    config,
    controllers::ControllerTimeouts,
    resources::{LabInstanceSpec, WorkerPoolSpec, WorkerSpec},
    runtime::{Collaborators, ControlPlane},
    store::InMemoryStore,
};
use labfleet_reconcile::SystemClock;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LABFLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting labfleet control plane");
    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        strategy = %config.scheduling_strategy,
        licensing_required = config.licensing_required,
        watch_interval_secs = config.watch_interval.as_secs(),
        "Configuration loaded"
    );

    let clock = Arc::new(SystemClock);
    let collaborators = Collaborators {
        labs: Arc::new(InMemoryStore::<LabInstanceSpec>::new()),
        workers: Arc::new(InMemoryStore::<WorkerSpec>::new()),
        pools: Arc::new(InMemoryStore::<WorkerPoolSpec>::new()),
        cloud: Arc::new(MockCloudProvider::new()),
        hypervisor: Arc::new(MockHypervisor::with_clock(clock.clone())),
        events: Arc::new(TracingPublisher),
        clock,
    };

    let shutdown_timeout = config.shutdown_timeout;
    let control_plane = ControlPlane::new(collaborators, config, ControllerTimeouts::default());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = control_plane.spawn(&shutdown_rx);

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    // Wait for loops to finish their in-flight pass
    info!("Waiting for loops to shut down...");
    for (name, handle) in handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(task = name, error = %e, "Loop did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
