//! `voxscaled run`: the control loop plus the operator API.
//!
//! Collaborators named under `[sources]` are reached over HTTP; any that
//! are left unset run in-memory so a partial deployment still starts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use voxscale_api::{ApiState, build_router};
use voxscale_control::{Collaborators, ControlLoop, fallback_consumer};
use voxscale_core::ControlConfig;
use voxscale_fleet::http::HttpFleetApi;
use voxscale_fleet::{DrainFn, FleetApi, SimulatedFleet};
use voxscale_monitor::http::{HttpQueueSource, HttpTelemetrySource};
use voxscale_monitor::{InMemoryQueue, InMemoryTelemetry, QueueSource, TelemetrySource};
use voxscale_state::StateStore;

/// Build collaborators from `[sources]` and `[fallback]`.
pub fn collaborators(config: &ControlConfig) -> Collaborators {
    let timeout = config.scrape_timeout();

    let (queue, drain): (Arc<dyn QueueSource>, Option<DrainFn>) = match &config.sources.queue {
        Some(address) => (Arc::new(HttpQueueSource::new(address.clone(), timeout)), None),
        None => {
            warn!(queue = %config.queue.name, "no queue source configured, using in-memory queue");
            let queue = InMemoryQueue::new();
            let handle = queue.clone();
            let drain: DrainFn = Arc::new(move || handle.take_one());
            (Arc::new(queue), Some(drain))
        }
    };

    let telemetry: Arc<dyn TelemetrySource> = match &config.sources.telemetry {
        Some(address) => Arc::new(HttpTelemetrySource::new(address.clone(), timeout)),
        None => {
            warn!(fleet = %config.fleet.name, "no telemetry source configured, TTFA policy idle");
            Arc::new(InMemoryTelemetry::new())
        }
    };

    let fleet: Arc<dyn FleetApi> = match &config.sources.fleet {
        Some(address) => Arc::new(HttpFleetApi::new(
            address.clone(),
            config.fleet.name.clone(),
            timeout,
        )),
        None => {
            warn!(fleet = %config.fleet.name, "no fleet API configured, using simulated fleet");
            Arc::new(SimulatedFleet::new(config.fleet.min))
        }
    };

    let fallback = config
        .fallback
        .as_ref()
        .map(|f| fallback_consumer(f, timeout, drain));

    Collaborators {
        queue,
        telemetry,
        fleet,
        fallback,
    }
}

pub async fn run(config_path: &Path, port: Option<u16>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "voxscale daemon starting");
    let config = ControlConfig::from_file(config_path)?;

    // ── State store ────────────────────────────────────────────

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.store.data_dir));
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("voxscale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Control loop ───────────────────────────────────────────

    let control = ControlLoop::from_config(&config, store.clone(), collaborators(&config))?;
    info!(
        fleet = %config.fleet.name,
        queue = %config.queue.name,
        min = config.fleet.min,
        max = config.fleet.max,
        windows = config.schedule.len(),
        fallback = config.fallback.is_some(),
        "control loop initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_handle = tokio::spawn(control.run(shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState {
        store,
        fleet: config.fleet.name.clone(),
        queue: config.queue.name.clone(),
        min: config.fleet.min,
        max: config.fleet.max,
    });

    let mut addr: SocketAddr = config.api.listen.parse()?;
    if let Some(port) = port {
        addr.set_port(port);
    }
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for an in-flight apply to finish.
    let _ = control_handle.await;

    info!("voxscale daemon stopped");
    Ok(())
}
