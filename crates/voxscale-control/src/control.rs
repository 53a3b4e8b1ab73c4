//! The per-fleet control loop.
//!
//! Each cycle:
//!
//! 1. refresh the fleet from the provider (counts, protection, shortfall)
//! 2. sample the queue and the telemetry sink concurrently
//! 3. run the decision engine
//! 4. persist the target and apply it
//! 5. publish health events and the status record
//!
//! Steps 1-3 are abandoned on shutdown. Once a target is being applied
//! the cycle runs to completion.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use voxscale_autoscale::{DecisionEngine, DecisionInputs, EngineSettings, ScaleDecision};
use voxscale_core::config::{FallbackConfig, FallbackKind};
use voxscale_core::{ControlConfig, WindowSet};
use voxscale_fleet::{
    ActiveJobTracker, ControllerSettings, CpuMockConsumer, DrainFn, FallbackConsumer,
    FallbackSupervisor, FleetApi, FleetController, HttpFallbackSwitch,
};
use voxscale_monitor::{
    BacklogMonitor, LatencyAggregate, MonitorSettings, QueueSource, TelemetrySource,
    recommended_visibility_timeout,
};
use voxscale_state::{
    CapacityHealth, ControlStatus, FleetState, HealthEvent, HealthEventKind, ManualOverride,
    QueueSnapshot, StateStore,
};

use crate::bus::EventBus;

/// The external systems one control loop talks to.
pub struct Collaborators {
    pub queue: Arc<dyn QueueSource>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub fleet: Arc<dyn FleetApi>,
    pub fallback: Option<Arc<dyn FallbackConsumer>>,
}

/// Build the fallback consumer described by `[fallback]`.
pub fn fallback_consumer(
    config: &FallbackConfig,
    timeout: Duration,
    drain: Option<DrainFn>,
) -> Arc<dyn FallbackConsumer> {
    match config.kind {
        FallbackKind::CpuMock => {
            let mut mock = CpuMockConsumer::new(
                Duration::from_millis(config.mock_min_ms),
                Duration::from_millis(config.mock_max_ms),
            );
            if let Some(drain) = drain {
                mock = mock.with_drain_fn(drain);
            }
            Arc::new(mock)
        }
        FallbackKind::Http => Arc::new(HttpFallbackSwitch::new(
            config.address.clone().unwrap_or_default(),
            timeout,
        )),
    }
}

/// What one cycle saw and did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub snapshot: QueueSnapshot,
    pub decision: ScaleDecision,
    pub fleet: FleetState,
    pub events: Vec<HealthEvent>,
    pub status: ControlStatus,
}

/// Sampling and decision output, before anything is applied.
struct Plan {
    snapshot: QueueSnapshot,
    latency: Option<LatencyAggregate>,
    decision: ScaleDecision,
    events: Vec<HealthEvent>,
}

pub struct ControlLoop {
    fleet: String,
    queue: String,
    interval: Duration,
    retention: usize,
    store: StateStore,
    bus: EventBus,
    windows: WindowSet,
    monitor: BacklogMonitor,
    engine: DecisionEngine,
    controller: FleetController,
    jobs: ActiveJobTracker,
    fallback: Option<FallbackSupervisor>,
    initialized: bool,
}

impl ControlLoop {
    /// Assemble a loop for the fleet in `config`. The decision engine
    /// resumes from the last persisted target, if any.
    pub fn from_config(
        config: &ControlConfig,
        store: StateStore,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let windows = WindowSet::compile(&config.schedule).context("invalid schedule")?;

        let mut engine = DecisionEngine::new(EngineSettings::from_config(config));
        if let Some(previous) = store.latest_target(&config.fleet.name)? {
            // Targets are re-persisted every cycle; the status record keeps
            // the time of the last actual change.
            let last_change_at = store
                .get_status(&config.fleet.name)?
                .and_then(|status| status.last_change_at);
            info!(
                fleet = %config.fleet.name,
                desired = previous.desired_capacity,
                computed_at = previous.computed_at,
                last_change_at,
                "resuming from persisted target"
            );
            engine = engine.with_previous(previous, last_change_at);
        }

        let jobs = ActiveJobTracker::new(store.clone(), config.active_job_ttl());
        let mut controller_settings = ControllerSettings::from_config(config);
        controller_settings.fallback_configured = collaborators.fallback.is_some();
        let controller = FleetController::new(
            controller_settings,
            collaborators.fleet,
            jobs.clone(),
            store.clone(),
        );

        let monitor = BacklogMonitor::new(
            MonitorSettings::from_config(config),
            collaborators.queue,
            collaborators.telemetry,
        );

        Ok(Self {
            fleet: config.fleet.name.clone(),
            queue: config.queue.name.clone(),
            interval: config.sample_interval(),
            retention: config.store.retention,
            bus: EventBus::new(store.clone()),
            store,
            windows,
            monitor,
            engine,
            controller,
            jobs,
            fallback: collaborators.fallback.map(FallbackSupervisor::new),
            initialized: false,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.bus.subscribe()
    }

    pub fn fleet_state(&self) -> &FleetState {
        self.controller.state()
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Adopt the provider's current fleet size. Retried on every tick
    /// until it succeeds.
    pub async fn initialize(&mut self, now: u64) -> anyhow::Result<()> {
        let state = self.controller.initialize(now).await?;
        self.initialized = true;
        debug!(fleet = %self.fleet, capacity = state.current_capacity, "control loop initialized");
        Ok(())
    }

    /// Run one full cycle at `now`.
    pub async fn tick(&mut self, now: u64) -> anyhow::Result<CycleReport> {
        let plan = self.plan(now).await?;
        self.execute(plan, now).await
    }

    async fn plan(&mut self, now: u64) -> anyhow::Result<Plan> {
        if !self.initialized
            && let Err(e) = self.initialize(now).await
        {
            warn!(fleet = %self.fleet, error = %e, "fleet initialization failed, will retry");
        }

        let mut events = Vec::new();
        if self.initialized
            && let Err(e) = self.controller.refresh(now).await
        {
            warn!(fleet = %self.fleet, error = %e, "fleet refresh failed");
        }
        events.extend(self.controller.take_events());
        self.jobs.prune(now)?;

        let observation = self.monitor.observe(now).await;
        events.extend(observation.events);

        // Stale snapshots repeat an earlier sample and are not recorded again.
        if !observation.snapshot.stale {
            self.store.put_snapshot(&observation.snapshot)?;
        }

        let manual = self.active_override(now)?;
        let windows = self.windows.active(now);
        let latency_p95_ms = observation.latency.as_ref().and_then(|l| l.p95_ms);

        let decision = self.engine.decide(
            &DecisionInputs {
                snapshot: &observation.snapshot,
                latency_p95_ms,
                windows: &windows,
                manual: manual.as_ref(),
                current_capacity: self.controller.state().current_capacity,
            },
            now,
        );

        Ok(Plan {
            snapshot: observation.snapshot,
            latency: observation.latency,
            decision,
            events,
        })
    }

    async fn execute(&mut self, plan: Plan, now: u64) -> anyhow::Result<CycleReport> {
        let Plan {
            snapshot,
            latency,
            decision,
            mut events,
        } = plan;

        let target = decision.target().clone();
        if !matches!(decision, ScaleDecision::Suppressed { .. }) {
            self.store.put_target(&target)?;
        }

        // Every cycle re-applies the standing target, so a scale-in deferred
        // by active renders or the cooldown is retried.
        let fleet = if self.initialized {
            match self.controller.apply(&target, now).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        fleet = %self.fleet,
                        desired = target.desired_capacity,
                        error = %e,
                        "apply failed"
                    );
                    self.controller.state().clone()
                }
            }
        } else {
            self.controller.state().clone()
        };
        events.extend(self.controller.take_events());

        if events
            .iter()
            .any(|e| matches!(e.kind, HealthEventKind::FleetChanged { .. }))
        {
            self.monitor.note_fleet_changed();
        }

        if let Some(supervisor) = &self.fallback {
            let mut follow_ups = Vec::new();
            for event in &events {
                if let Some(follow_up) = supervisor.handle(event).await {
                    follow_ups.push(follow_up);
                }
            }
            events.extend(follow_ups);
        }

        for event in &events {
            self.bus.publish(event)?;
        }

        let status = self.status(latency.as_ref(), now)?;
        self.store.put_status(&status)?;

        let pruned = self
            .store
            .prune_feeds(&self.fleet, &self.queue, self.retention)?;
        if pruned > 0 {
            debug!(fleet = %self.fleet, pruned, "feeds pruned");
        }

        Ok(CycleReport {
            snapshot,
            decision,
            fleet,
            events,
            status,
        })
    }

    fn active_override(&self, now: u64) -> anyhow::Result<Option<ManualOverride>> {
        let Some(manual) = self.store.get_override(&self.fleet)? else {
            return Ok(None);
        };
        if manual.is_active(now) {
            return Ok(Some(manual));
        }
        self.store.clear_override(&self.fleet)?;
        info!(fleet = %self.fleet, desired = manual.desired, "manual override expired");
        Ok(None)
    }

    fn status(&self, latency: Option<&LatencyAggregate>, now: u64) -> anyhow::Result<ControlStatus> {
        let latency_p95_ms = latency.and_then(|l| l.p95_ms);
        let capacity_health = if self.fallback.as_ref().is_some_and(|f| f.is_active()) {
            CapacityHealth::Fallback
        } else {
            self.controller.capacity_health()
        };
        let gpu_available = self.controller.gpu_available();
        if !gpu_available && self.controller.state().current_capacity > 0 {
            debug!(fleet = %self.fleet, "no in-service GPU worker");
        }

        Ok(ControlStatus {
            fleet: self.fleet.clone(),
            capacity_health,
            consecutive_stale: self.monitor.consecutive_stale(),
            latency_p95_ms,
            recommended_visibility_timeout_secs: recommended_visibility_timeout(latency_p95_ms)
                .as_secs(),
            active_renders: self.jobs.aggregate(now)?,
            gpu_available,
            last_change_at: self.engine.last_change_at(),
            updated_at: now,
        })
    }

    /// Stop the fallback consumer, if one is running.
    pub async fn stop(&self) {
        if let Some(supervisor) = &self.fallback {
            supervisor.shutdown().await;
        }
    }

    /// Tick every sampling interval until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            fleet = %self.fleet,
            queue = %self.queue,
            interval_secs = self.interval.as_secs(),
            "control loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let now = epoch_secs();
            let plan = tokio::select! {
                plan = self.plan(now) => plan,
                _ = shutdown.changed() => {
                    info!(fleet = %self.fleet, "shutdown during sampling, cycle abandoned");
                    break;
                }
            };

            let plan = match plan {
                Ok(plan) => plan,
                Err(e) => {
                    error!(fleet = %self.fleet, error = %e, "control cycle failed");
                    continue;
                }
            };

            match self.execute(plan, now).await {
                Ok(report) => debug!(
                    fleet = %self.fleet,
                    depth = report.snapshot.depth,
                    age = report.snapshot.oldest_age_seconds,
                    stale = report.snapshot.stale,
                    desired = report.decision.target().desired_capacity,
                    capacity = report.fleet.current_capacity,
                    "control cycle complete"
                ),
                Err(e) => error!(fleet = %self.fleet, error = %e, "control cycle failed"),
            }
        }

        self.stop().await;
        info!(fleet = %self.fleet, "control loop stopped");
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
