//! Degraded-mode fallback consumers and their supervisor.
//!
//! When the GPU fleet cannot reach its desired size, a fallback consumer
//! drains the queue at reduced fidelity instead of letting the backlog
//! grow without bound. The supervisor switches it on at
//! `CapacityShortfall` and off at `CapacityRestored`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxscale_core::http::post_json;
use voxscale_state::{HealthEvent, HealthEventKind};

use crate::error::{FleetError, FleetResult};

/// Takes one job off the queue. Returns false when there was nothing to take.
pub type DrainFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// A consumer that can stand in for the GPU fleet.
#[async_trait]
pub trait FallbackConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn activate(&self) -> FleetResult<()>;

    async fn deactivate(&self) -> FleetResult<()>;

    fn is_active(&self) -> bool;
}

// ── CPU mock ──────────────────────────────────────────────────────

struct MockTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// In-process consumer that fakes renders with a random latency.
pub struct CpuMockConsumer {
    min_latency: Duration,
    max_latency: Duration,
    idle_poll: Duration,
    drain: Option<DrainFn>,
    rendered: Arc<AtomicU64>,
    task: Mutex<Option<MockTask>>,
}

impl CpuMockConsumer {
    pub fn new(min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            min_latency: min_latency.min(max_latency),
            max_latency: max_latency.max(min_latency),
            idle_poll: Duration::from_secs(1),
            drain: None,
            rendered: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Set the callback that takes a job off the queue.
    pub fn with_drain_fn(mut self, drain: DrainFn) -> Self {
        self.drain = Some(drain);
        self
    }

    /// How long to wait before polling an empty queue again.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Jobs faked since construction.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<MockTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Uniform render latency in `[min, max]`.
fn render_latency(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if min_ms >= max_ms {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

async fn run_mock(
    min: Duration,
    max: Duration,
    idle_poll: Duration,
    drain: Option<DrainFn>,
    rendered: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let took = drain.as_ref().is_some_and(|take| take());
        let wait = if took { render_latency(min, max) } else { idle_poll };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if took {
                    let total = rendered.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(latency_ms = wait.as_millis() as u64, total, "cpu mock rendered job");
                }
            }
            _ = stop.changed() => break,
        }
    }
}

#[async_trait]
impl FallbackConsumer for CpuMockConsumer {
    fn name(&self) -> &str {
        "cpu_mock"
    }

    async fn activate(&self) -> FleetResult<()> {
        let mut task = self.lock_task();
        if task.is_some() {
            return Ok(());
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_mock(
            self.min_latency,
            self.max_latency,
            self.idle_poll,
            self.drain.clone(),
            self.rendered.clone(),
            stop_rx,
        ));
        *task = Some(MockTask { handle, stop });
        info!(
            min_ms = self.min_latency.as_millis() as u64,
            max_ms = self.max_latency.as_millis() as u64,
            "cpu mock consumer started"
        );
        Ok(())
    }

    async fn deactivate(&self) -> FleetResult<()> {
        let Some(task) = self.lock_task().take() else {
            return Ok(());
        };
        let _ = task.stop.send(true);
        task.handle
            .await
            .map_err(|e| FleetError::Fallback(e.to_string()))?;
        info!(rendered = self.rendered(), "cpu mock consumer stopped");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lock_task().is_some()
    }
}

// ── HTTP switch ───────────────────────────────────────────────────

/// An external fallback consumer toggled with `POST /fallback {"active": bool}`.
pub struct HttpFallbackSwitch {
    address: String,
    timeout: Duration,
    active: AtomicBool,
}

impl HttpFallbackSwitch {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            active: AtomicBool::new(false),
        }
    }

    async fn set(&self, active: bool) -> FleetResult<()> {
        post_json(
            &self.address,
            "/fallback",
            &json!({ "active": active }),
            self.timeout,
        )
        .await
        .map_err(|e| FleetError::Fallback(e.to_string()))?;
        self.active.store(active, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FallbackConsumer for HttpFallbackSwitch {
    fn name(&self) -> &str {
        "http"
    }

    async fn activate(&self) -> FleetResult<()> {
        self.set(true).await
    }

    async fn deactivate(&self) -> FleetResult<()> {
        self.set(false).await
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

// ── Supervisor ────────────────────────────────────────────────────

/// Follows capacity events and switches the fallback consumer.
pub struct FallbackSupervisor {
    consumer: Arc<dyn FallbackConsumer>,
}

impl FallbackSupervisor {
    pub fn new(consumer: Arc<dyn FallbackConsumer>) -> Self {
        Self { consumer }
    }

    pub fn is_active(&self) -> bool {
        self.consumer.is_active()
    }

    /// React to one health event. Returns the resulting fallback event,
    /// if the consumer changed state.
    pub async fn handle(&self, event: &HealthEvent) -> Option<HealthEvent> {
        match &event.kind {
            HealthEventKind::CapacityShortfall { .. } if !self.consumer.is_active() => {
                match self.consumer.activate().await {
                    Ok(()) => {
                        warn!(consumer = self.consumer.name(), "fallback consumer activated");
                        Some(HealthEvent::new(event.at, HealthEventKind::FallbackActivated))
                    }
                    Err(e) => {
                        warn!(consumer = self.consumer.name(), error = %e, "fallback activation failed");
                        None
                    }
                }
            }
            HealthEventKind::CapacityRestored { .. } if self.consumer.is_active() => {
                match self.consumer.deactivate().await {
                    Ok(()) => {
                        info!(consumer = self.consumer.name(), "fallback consumer deactivated");
                        Some(HealthEvent::new(event.at, HealthEventKind::FallbackDeactivated))
                    }
                    Err(e) => {
                        warn!(consumer = self.consumer.name(), error = %e, "fallback deactivation failed");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Stop the consumer on shutdown.
    pub async fn shutdown(&self) {
        if self.consumer.is_active()
            && let Err(e) = self.consumer.deactivate().await
        {
            warn!(error = %e, "fallback consumer did not stop cleanly");
        }
    }
}
