//! FleetController: reconciles the worker fleet toward the latest target.
//!
//! `apply` never waits for instances to become healthy. `refresh` polls
//! the provider on every tick, keeps in-service and pending counts
//! current, syncs per-instance scale-in protection with active renders,
//! and tracks capacity shortfall episodes against the grace period.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use voxscale_core::ControlConfig;
use voxscale_state::{
    CapacityHealth, FleetState, HealthEvent, HealthEventKind, ScalingTarget, StateStore,
};

use crate::api::{FleetApi, InstanceEvent, InstanceLifecycle, WorkerInstance};
use crate::error::{FleetError, FleetResult};
use crate::jobs::ActiveJobTracker;

/// Controller knobs, usually derived from `voxscale.toml`.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub fleet: String,
    /// Minimum time between two scale-ins.
    pub scale_in_cooldown: Duration,
    /// How long in-service capacity may trail desired before a shortfall.
    pub grace_period: Duration,
    pub max_scale_out_step: Option<u32>,
    /// Shortfalls past the grace period are only raised when a fallback
    /// consumer can act on them.
    pub fallback_configured: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            fleet: config.fleet.name.clone(),
            scale_in_cooldown: config.scale_in_cooldown(),
            grace_period: config.grace_period(),
            max_scale_out_step: config.fleet.max_scale_out_step,
            fallback_configured: config.fallback.is_some(),
        }
    }
}

/// Open capacity shortfall.
#[derive(Debug, Clone, Copy)]
struct Shortfall {
    since: u64,
    raised: bool,
}

/// Sole owner of a fleet's `FleetState`.
pub struct FleetController {
    settings: ControllerSettings,
    api: Arc<dyn FleetApi>,
    jobs: ActiveJobTracker,
    store: StateStore,
    state: FleetState,
    /// Latest target desired capacity.
    desired: u32,
    instances: Vec<WorkerInstance>,
    last_scale_in_at: Option<u64>,
    shortfall: Option<Shortfall>,
    pending_events: Vec<HealthEvent>,
}

impl FleetController {
    pub fn new(
        settings: ControllerSettings,
        api: Arc<dyn FleetApi>,
        jobs: ActiveJobTracker,
        store: StateStore,
    ) -> Self {
        let state = FleetState::new(&settings.fleet, 0, 0);
        Self {
            settings,
            api,
            jobs,
            store,
            state,
            desired: 0,
            instances: Vec::new(),
            last_scale_in_at: None,
            shortfall: None,
            pending_events: Vec::new(),
        }
    }

    /// Read the fleet from the provider and adopt its size.
    pub async fn initialize(&mut self, now: u64) -> FleetResult<FleetState> {
        self.instances = self.api.list_instances().await?;
        let live = self
            .instances
            .iter()
            .filter(|i| i.lifecycle != InstanceLifecycle::Terminating)
            .count() as u32;
        self.state.current_capacity = live;
        self.desired = live;
        self.recount(now);
        self.persist()?;
        info!(
            fleet = %self.settings.fleet,
            capacity = live,
            in_service = self.state.in_service,
            "fleet controller initialized"
        );
        Ok(self.state.clone())
    }

    pub fn state(&self) -> &FleetState {
        &self.state
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn take_events(&mut self) -> Vec<HealthEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// At least one in-service, healthy instance.
    pub fn gpu_available(&self) -> bool {
        self.instances.iter().any(WorkerInstance::is_serving)
    }

    pub fn capacity_health(&self) -> CapacityHealth {
        match self.shortfall {
            Some(Shortfall { raised: true, .. }) => CapacityHealth::Shortfall,
            _ => CapacityHealth::Healthy,
        }
    }

    /// Move capacity toward `target.desired_capacity`.
    pub async fn apply(&mut self, target: &ScalingTarget, now: u64) -> FleetResult<FleetState> {
        self.desired = target.desired_capacity;
        let before = self.state.current_capacity;

        if target.desired_capacity > before {
            self.scale_out(before, target.desired_capacity, now).await?;
        } else if target.desired_capacity < before {
            self.scale_in(before, target.desired_capacity, now).await?;
        }

        self.state.updated_at = now;
        // The grace period runs from the moment capacity was requested.
        self.track_shortfall(now);
        self.persist()?;
        Ok(self.state.clone())
    }

    async fn scale_out(&mut self, before: u32, desired: u32, now: u64) -> FleetResult<()> {
        let gap = desired - before;
        let step = self.settings.max_scale_out_step.map_or(gap, |max| gap.min(max));
        let next = before + step;

        match self.api.set_desired_capacity(next).await {
            Ok(()) => {
                self.state.current_capacity = next;
                self.state.pending = self.state.pending.saturating_add(step);
                self.fleet_changed(before, next, now);
                Ok(())
            }
            Err(FleetError::ApplyRejected(cause)) => {
                warn!(
                    fleet = %self.settings.fleet,
                    requested = next,
                    %cause,
                    "provider rejected scale-out"
                );
                self.open_shortfall(now, cause);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn scale_in(&mut self, before: u32, desired: u32, now: u64) -> FleetResult<()> {
        let active = self.jobs.aggregate(now)?;
        if active > 0 {
            self.state.protected_from_scale_in = true;
            info!(
                fleet = %self.settings.fleet,
                active_renders = active,
                from = before,
                to = desired,
                "ActiveJobOverride: scale-in blocked by active renders"
            );
            return Ok(());
        }
        self.state.protected_from_scale_in = false;

        if let Some(at) = self.last_scale_in_at {
            let elapsed = now.saturating_sub(at);
            if elapsed < self.settings.scale_in_cooldown.as_secs() {
                debug!(
                    fleet = %self.settings.fleet,
                    elapsed,
                    cooldown = self.settings.scale_in_cooldown.as_secs(),
                    "scale-in cooldown active"
                );
                return Ok(());
            }
        }

        let instances = self.api.list_instances().await?;
        let has_age_data =
            !instances.is_empty() && instances.iter().all(|i| i.launched_at.is_some());
        let after = if has_age_data {
            self.terminate_oldest(&instances, before - desired).await?
        } else {
            debug!(fleet = %self.settings.fleet, "no launch times, using provider termination policy");
            self.api.set_desired_capacity(desired).await?;
            desired
        };
        let after = after.min(before);

        if after < before {
            self.state.current_capacity = after;
            self.state.in_service = self.state.in_service.min(after);
            self.state.pending = self.state.pending.min(after - self.state.in_service);
            self.last_scale_in_at = Some(now);
            self.fleet_changed(before, after, now);
        }
        Ok(())
    }

    /// Terminate up to `count` unprotected instances, oldest first.
    /// Returns the resulting capacity.
    async fn terminate_oldest(&self, instances: &[WorkerInstance], count: u32) -> FleetResult<u32> {
        let mut candidates: Vec<&WorkerInstance> = instances
            .iter()
            .filter(|i| i.lifecycle != InstanceLifecycle::Terminating && !i.protected)
            .collect();
        candidates.sort_by(|a, b| a.launched_at.cmp(&b.launched_at).then_with(|| a.id.cmp(&b.id)));

        let mut terminated = 0u32;
        for instance in candidates.into_iter().take(count as usize) {
            match self.api.terminate(&instance.id).await {
                Ok(()) => {
                    terminated += 1;
                    debug!(fleet = %self.settings.fleet, instance = %instance.id, "instance terminated");
                }
                Err(FleetError::ApplyRejected(cause) | FleetError::InstanceNotFound(cause)) => {
                    warn!(fleet = %self.settings.fleet, instance = %instance.id, %cause, "termination skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.state.current_capacity.saturating_sub(terminated))
    }

    /// Poll the provider and update counts, protection, and shortfall.
    pub async fn refresh(&mut self, now: u64) -> FleetResult<FleetState> {
        for event in self.api.drain_events().await? {
            self.on_instance_event(&event, now);
        }

        self.instances = self.api.list_instances().await?;
        self.recount(now);
        self.sync_protection(now).await?;
        self.track_shortfall(now);
        self.persist()?;
        Ok(self.state.clone())
    }

    /// Apply a provider lifecycle notice to the cached instance list.
    pub fn on_instance_event(&mut self, event: &InstanceEvent, now: u64) {
        match event {
            InstanceEvent::SpotInterruption { instance_id } => {
                warn!(fleet = %self.settings.fleet, instance = %instance_id, "spot interruption");
            }
            InstanceEvent::Terminated { instance_id } => {
                info!(fleet = %self.settings.fleet, instance = %instance_id, "instance terminated by provider");
            }
        }
        if let Some(instance) = self
            .instances
            .iter_mut()
            .find(|i| i.id == event.instance_id())
        {
            instance.lifecycle = InstanceLifecycle::Terminating;
        }
        self.recount(now);
    }

    /// Protect workers with active renders, release idle ones.
    pub async fn sync_protection(&mut self, now: u64) -> FleetResult<()> {
        let busy = self.jobs.busy_workers(now)?;
        self.state.protected_from_scale_in = !busy.is_empty();

        for instance in self.instances.iter_mut() {
            if instance.lifecycle == InstanceLifecycle::Terminating {
                continue;
            }
            let want = busy.contains(&instance.id);
            if instance.protected == want {
                continue;
            }
            match self.api.protect(&instance.id, want).await {
                Ok(()) => {
                    instance.protected = want;
                    debug!(fleet = %self.settings.fleet, instance = %instance.id, protected = want, "scale-in protection updated");
                }
                Err(FleetError::InstanceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn recount(&mut self, now: u64) {
        self.state.in_service = self.instances.iter().filter(|i| i.is_serving()).count() as u32;
        self.state.pending = self
            .instances
            .iter()
            .filter(|i| i.lifecycle == InstanceLifecycle::Pending)
            .count() as u32;
        self.state.updated_at = now;
    }

    fn track_shortfall(&mut self, now: u64) {
        let in_service = self.state.in_service;
        if in_service >= self.desired {
            if let Some(Shortfall { raised: true, .. }) = self.shortfall.take() {
                info!(fleet = %self.settings.fleet, in_service, "capacity restored");
                self.push_event(now, HealthEventKind::CapacityRestored { in_service });
            }
            self.shortfall = None;
            return;
        }

        let grace = self.settings.grace_period.as_secs();
        let fallback = self.settings.fallback_configured;
        let shortfall = self.shortfall.get_or_insert(Shortfall {
            since: now,
            raised: false,
        });
        if !shortfall.raised && fallback && now.saturating_sub(shortfall.since) >= grace {
            shortfall.raised = true;
            let desired = self.desired;
            warn!(
                fleet = %self.settings.fleet,
                desired,
                in_service,
                grace_secs = grace,
                "capacity shortfall past grace period"
            );
            self.push_event(
                now,
                HealthEventKind::CapacityShortfall {
                    desired,
                    in_service,
                    cause: "in-service capacity below desired past grace period".to_string(),
                },
            );
        }
    }

    fn open_shortfall(&mut self, now: u64, cause: String) {
        let already = matches!(self.shortfall, Some(Shortfall { raised: true, .. }));
        let since = self.shortfall.map_or(now, |s| s.since);
        self.shortfall = Some(Shortfall {
            since,
            raised: true,
        });
        if !already {
            self.push_event(
                now,
                HealthEventKind::CapacityShortfall {
                    desired: self.desired,
                    in_service: self.state.in_service,
                    cause,
                },
            );
        }
    }

    fn fleet_changed(&mut self, before: u32, after: u32, now: u64) {
        info!(fleet = %self.settings.fleet, from = before, to = after, "fleet capacity changed");
        self.push_event(now, HealthEventKind::FleetChanged { before, after });
    }

    fn push_event(&mut self, now: u64, kind: HealthEventKind) {
        self.pending_events.push(HealthEvent::new(now, kind));
    }

    fn persist(&self) -> FleetResult<()> {
        self.store.put_fleet_state(&self.state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedFleet;
    use voxscale_state::{ActiveJobSignal, ScalingReason};

    fn settings() -> ControllerSettings {
        ControllerSettings {
            fleet: "gpu-workers".to_string(),
            scale_in_cooldown: Duration::from_secs(300),
            grace_period: Duration::from_secs(300),
            max_scale_out_step: None,
            fallback_configured: true,
        }
    }

    async fn controller(
        fleet: &SimulatedFleet,
        settings: ControllerSettings,
    ) -> (FleetController, ActiveJobTracker, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let jobs = ActiveJobTracker::new(store.clone(), Duration::from_secs(180));
        let mut controller =
            FleetController::new(settings, Arc::new(fleet.clone()), jobs.clone(), store.clone());
        controller.initialize(0).await.unwrap();
        (controller, jobs, store)
    }

    fn target(desired: u32, at: u64) -> ScalingTarget {
        ScalingTarget::clamped("gpu-workers", desired, 0, 10, ScalingReason::Backlog, at)
    }

    fn kinds(events: &[HealthEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind.name()).collect()
    }

    #[tokio::test]
    async fn initialize_adopts_provider_size() {
        let fleet = SimulatedFleet::new(2);
        let (controller, _, store) = controller(&fleet, settings()).await;
        assert_eq!(controller.state().current_capacity, 2);
        assert_eq!(controller.state().in_service, 2);
        assert!(controller.gpu_available());
        assert_eq!(
            store.get_fleet_state("gpu-workers").unwrap().unwrap().current_capacity,
            2
        );
    }

    #[tokio::test]
    async fn scale_out_is_immediate() {
        let fleet = SimulatedFleet::new(1);
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        let state = controller.apply(&target(3, 60), 60).await.unwrap();
        assert_eq!(state.current_capacity, 3);
        assert_eq!(fleet.live_count(), 3);

        let events = controller.take_events();
        assert_eq!(kinds(&events), vec!["fleet_changed"]);
        assert_eq!(
            events[0].kind,
            HealthEventKind::FleetChanged {
                before: 1,
                after: 3
            }
        );
    }

    #[tokio::test]
    async fn scale_out_step_never_overshoots() {
        let fleet = SimulatedFleet::new(0);
        let mut s = settings();
        s.max_scale_out_step = Some(1);
        let (mut controller, _, _) = controller(&fleet, s).await;

        let mut seen = Vec::new();
        for t in 1..=4 {
            let state = controller.apply(&target(3, t), t).await.unwrap();
            seen.push(state.current_capacity);
        }
        assert_eq!(seen, vec![1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn active_jobs_block_scale_in() {
        let fleet = SimulatedFleet::new(2);
        let (mut controller, jobs, _) = controller(&fleet, settings()).await;
        jobs.report(&ActiveJobSignal {
            worker_id: "i-0001".to_string(),
            active_render_count: 1,
            reported_at: 50,
        })
        .unwrap();

        let state = controller.apply(&target(0, 60), 60).await.unwrap();
        assert_eq!(state.current_capacity, 2);
        assert!(state.protected_from_scale_in);
        assert!(controller.take_events().is_empty());

        // Once the report expires the scale-in goes through.
        let state = controller.apply(&target(0, 300), 300).await.unwrap();
        assert_eq!(state.current_capacity, 0);
    }

    #[tokio::test]
    async fn scale_in_respects_cooldown() {
        let fleet = SimulatedFleet::new(4);
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        assert_eq!(controller.apply(&target(3, 10), 10).await.unwrap().current_capacity, 3);
        assert_eq!(controller.apply(&target(2, 100), 100).await.unwrap().current_capacity, 3);
        assert_eq!(controller.apply(&target(2, 310), 310).await.unwrap().current_capacity, 2);
    }

    #[tokio::test]
    async fn scale_in_terminates_oldest_first() {
        let fleet = SimulatedFleet::new(0);
        for (i, at) in [300u64, 100, 200].iter().enumerate() {
            fleet.set_clock(*at);
            fleet.set_desired_capacity(i as u32 + 1).await.unwrap();
        }
        // i-0001 @300, i-0002 @100, i-0003 @200
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        controller.apply(&target(1, 400), 400).await.unwrap();
        let live = |id: &str| fleet.instance(id).unwrap().lifecycle != InstanceLifecycle::Terminating;
        assert!(live("i-0001"));
        assert!(!live("i-0002"));
        assert!(!live("i-0003"));
    }

    #[tokio::test]
    async fn scale_in_skips_protected_instances() {
        let fleet = SimulatedFleet::new(2);
        fleet.protect("i-0001", true).await.unwrap();
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        let state = controller.apply(&target(0, 10), 10).await.unwrap();
        assert_eq!(state.current_capacity, 1);
        assert_eq!(
            fleet.instance("i-0001").unwrap().lifecycle,
            InstanceLifecycle::InService
        );
    }

    #[tokio::test]
    async fn scale_in_without_age_data_uses_provider_policy() {
        let fleet = SimulatedFleet::new(3);
        fleet.set_hide_launch_times(true);
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        let state = controller.apply(&target(1, 10), 10).await.unwrap();
        assert_eq!(state.current_capacity, 1);
        assert_eq!(fleet.desired_calls(), vec![1]);
    }

    #[tokio::test]
    async fn rejected_apply_raises_shortfall_once() {
        let fleet = SimulatedFleet::new(1);
        fleet.set_quota(Some(1));
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        let state = controller.apply(&target(3, 10), 10).await.unwrap();
        assert_eq!(state.current_capacity, 1);
        controller.apply(&target(3, 70), 70).await.unwrap();

        let events = controller.take_events();
        assert_eq!(kinds(&events), vec!["capacity_shortfall"]);
        assert_eq!(controller.capacity_health(), CapacityHealth::Shortfall);

        // Target drops back to what the fleet can serve.
        controller.apply(&target(1, 130), 130).await.unwrap();
        controller.refresh(130).await.unwrap();
        assert_eq!(kinds(&controller.take_events()), vec!["capacity_restored"]);
        assert_eq!(controller.capacity_health(), CapacityHealth::Healthy);
    }

    #[tokio::test]
    async fn shortfall_after_grace_period() {
        let fleet = SimulatedFleet::new(0);
        fleet.set_hold_pending(true);
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        controller.apply(&target(2, 0), 0).await.unwrap();
        controller.take_events();

        let state = controller.refresh(100).await.unwrap();
        assert_eq!(state.pending, 2);
        assert_eq!(state.in_service, 0);
        assert!(controller.take_events().is_empty());
        assert!(!controller.gpu_available());

        controller.refresh(300).await.unwrap();
        assert_eq!(kinds(&controller.take_events()), vec!["capacity_shortfall"]);
        controller.refresh(360).await.unwrap();
        assert!(controller.take_events().is_empty());

        fleet.promote_pending();
        let state = controller.refresh(420).await.unwrap();
        assert_eq!(state.in_service, 2);
        assert_eq!(kinds(&controller.take_events()), vec!["capacity_restored"]);
        assert!(controller.gpu_available());
    }

    #[tokio::test]
    async fn no_grace_shortfall_without_fallback() {
        let fleet = SimulatedFleet::new(0);
        fleet.set_hold_pending(true);
        let mut s = settings();
        s.fallback_configured = false;
        let (mut controller, _, _) = controller(&fleet, s).await;

        controller.apply(&target(2, 0), 0).await.unwrap();
        controller.take_events();
        controller.refresh(1000).await.unwrap();
        assert!(controller.take_events().is_empty());
    }

    #[tokio::test]
    async fn protection_follows_active_renders() {
        let fleet = SimulatedFleet::new(2);
        let (mut controller, jobs, _) = controller(&fleet, settings()).await;

        jobs.report(&ActiveJobSignal {
            worker_id: "i-0002".to_string(),
            active_render_count: 3,
            reported_at: 10,
        })
        .unwrap();
        let state = controller.refresh(20).await.unwrap();
        assert!(state.protected_from_scale_in);
        assert!(fleet.instance("i-0002").unwrap().protected);
        assert!(!fleet.instance("i-0001").unwrap().protected);

        jobs.report(&ActiveJobSignal {
            worker_id: "i-0002".to_string(),
            active_render_count: 0,
            reported_at: 30,
        })
        .unwrap();
        let state = controller.refresh(40).await.unwrap();
        assert!(!state.protected_from_scale_in);
        assert!(!fleet.instance("i-0002").unwrap().protected);
    }

    #[tokio::test]
    async fn spot_interruption_reduces_in_service() {
        let fleet = SimulatedFleet::new(1);
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        fleet.interrupt("i-0001");
        let state = controller.refresh(10).await.unwrap();
        assert_eq!(state.in_service, 0);
        assert!(!controller.gpu_available());
    }

    #[tokio::test]
    async fn provider_event_updates_cached_counts() {
        let fleet = SimulatedFleet::new(2);
        let (mut controller, _, _) = controller(&fleet, settings()).await;

        controller.on_instance_event(
            &InstanceEvent::Terminated {
                instance_id: "i-0001".to_string(),
            },
            5,
        );
        assert_eq!(controller.state().in_service, 1);
    }

    #[tokio::test]
    async fn apply_then_query_moves_monotonically() {
        let fleet = SimulatedFleet::new(0);
        let mut s = settings();
        s.max_scale_out_step = Some(2);
        let (mut controller, _, store) = controller(&fleet, s).await;

        let mut last = 0;
        for t in 0..4 {
            controller.apply(&target(5, t), t).await.unwrap();
            let queried = store.get_fleet_state("gpu-workers").unwrap().unwrap();
            assert!(queried.current_capacity >= last);
            assert!(queried.current_capacity <= 5);
            last = queried.current_capacity;
        }
        assert_eq!(last, 5);
    }
}
