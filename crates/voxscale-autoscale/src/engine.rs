//! DecisionEngine: combines the policies into one ScalingTarget per cycle.

use std::time::Duration;

use tracing::{debug, info};

use voxscale_core::{ControlConfig, ScheduledCapacity};
use voxscale_state::{ManualOverride, QueueSnapshot, ScalingReason, ScalingTarget};

use crate::policy::{BacklogPolicy, LatencyPolicy, Proposal, select_window};

/// Engine knobs, usually derived from `voxscale.toml`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fleet: String,
    pub min: u32,
    pub max: u32,
    pub target_age_secs: f64,
    pub scale_out_periods: u32,
    pub scale_in_periods: u32,
    pub per_worker_throughput: f64,
    pub latency_threshold_ms: f64,
    pub latency_periods: u32,
    /// Cooldown between changes of desired capacity.
    pub warmup: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            fleet: config.fleet.name.clone(),
            min: config.fleet.min,
            max: config.fleet.max,
            target_age_secs: config.backlog.target_age_secs,
            scale_out_periods: config.backlog.scale_out_periods,
            scale_in_periods: config.backlog.scale_in_periods,
            per_worker_throughput: config.backlog.per_worker_throughput,
            latency_threshold_ms: config.latency.threshold_ms,
            latency_periods: config.latency.evaluation_periods,
            warmup: config.instance_warmup(),
        }
    }
}

/// One cycle's worth of signals.
#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub snapshot: &'a QueueSnapshot,
    pub latency_p95_ms: Option<f64>,
    /// Scheduled windows open this cycle, in config order.
    pub windows: &'a [ScheduledCapacity],
    pub manual: Option<&'a ManualOverride>,
    /// Capacity the fleet controller last reported.
    pub current_capacity: u32,
}

/// Outcome of one decision cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    /// Desired capacity changed.
    ScaleTo(ScalingTarget),
    /// Desired capacity held.
    NoChange(ScalingTarget),
    /// A change fell inside the cooldown; the previous target still stands.
    Suppressed {
        target: ScalingTarget,
        proposed: u32,
        reason: ScalingReason,
    },
}

impl ScaleDecision {
    /// The authoritative target after this cycle.
    pub fn target(&self) -> &ScalingTarget {
        match self {
            ScaleDecision::ScaleTo(t) | ScaleDecision::NoChange(t) => t,
            ScaleDecision::Suppressed { target, .. } => target,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, ScaleDecision::ScaleTo(_))
    }
}

/// The scaling decision engine for one fleet.
pub struct DecisionEngine {
    settings: EngineSettings,
    backlog: BacklogPolicy,
    latency: LatencyPolicy,
    previous: Option<ScalingTarget>,
    last_change_at: Option<u64>,
}

impl DecisionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            backlog: BacklogPolicy::new(
                settings.target_age_secs,
                settings.scale_out_periods,
                settings.scale_in_periods,
                settings.per_worker_throughput,
            ),
            latency: LatencyPolicy::new(settings.latency_threshold_ms, settings.latency_periods),
            settings,
            previous: None,
            last_change_at: None,
        }
    }

    /// Resume from a persisted target. `last_change_at` is when desired
    /// capacity last moved, not when the target was last recomputed; `None`
    /// leaves no cooldown running.
    pub fn with_previous(mut self, target: ScalingTarget, last_change_at: Option<u64>) -> Self {
        self.last_change_at = last_change_at;
        self.previous = Some(target);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn previous(&self) -> Option<&ScalingTarget> {
        self.previous.as_ref()
    }

    pub fn last_change_at(&self) -> Option<u64> {
        self.last_change_at
    }

    /// Run one decision cycle.
    pub fn decide(&mut self, inputs: &DecisionInputs<'_>, now: u64) -> ScaleDecision {
        let base = self
            .previous
            .as_ref()
            .map_or(inputs.current_capacity, |t| t.desired_capacity);

        self.backlog.observe(inputs.snapshot);
        self.latency.observe(inputs.latency_p95_ms);

        if let Some(manual) = inputs.manual.filter(|m| m.is_active(now)) {
            let target = ScalingTarget::clamped(
                &self.settings.fleet,
                manual.desired,
                self.settings.min,
                self.settings.max,
                ScalingReason::Manual,
                now,
            );
            // Latency counters still advance; only the result is replaced.
            let _ = self.latency.propose(base);
            return self.commit(target, base, now);
        }

        if inputs.snapshot.stale {
            return self.hold_on_stale(base, now);
        }

        let target = self.combine(inputs, base, now);
        let desired = target.desired_capacity;

        if desired != base && self.in_cooldown(now) && !is_emergency(base, desired) {
            info!(
                fleet = %self.settings.fleet,
                from = base,
                proposed = desired,
                reason = %target.reason,
                "DecisionSuppressed: inside instance warmup"
            );
            let previous = self
                .previous
                .clone()
                .unwrap_or_else(|| self.hold_target(base, ScalingReason::Backlog, now));
            return ScaleDecision::Suppressed {
                target: previous,
                proposed: desired,
                reason: target.reason,
            };
        }

        self.commit(target, base, now)
    }

    fn combine(&mut self, inputs: &DecisionInputs<'_>, base: u32, now: u64) -> ScalingTarget {
        let mut best = Proposal::new(
            ScalingReason::Backlog,
            self.backlog.propose(inputs.snapshot, base),
        );

        if let Some(desired) = self.latency.propose(base)
            && desired > best.desired
        {
            best = Proposal::new(ScalingReason::LatencySlo, desired);
        }

        let (min, max) = match select_window(inputs.windows) {
            Some(window) => {
                if window.desired > best.desired {
                    best = Proposal::new(ScalingReason::Schedule, window.desired);
                }
                (window.min, window.max)
            }
            None => (self.settings.min, self.settings.max),
        };

        debug!(
            fleet = %self.settings.fleet,
            base,
            proposed = best.desired,
            reason = %best.reason,
            min,
            max,
            above = self.backlog.above(),
            below = self.backlog.below(),
            latency_breaches = self.latency.breaches(),
            "policies evaluated"
        );

        ScalingTarget::clamped(&self.settings.fleet, best.desired, min, max, best.reason, now)
    }

    /// Stale snapshots never move capacity down.
    fn hold_on_stale(&mut self, base: u32, now: u64) -> ScaleDecision {
        // Consume a latency firing so the streak does not carry over.
        let _ = self.latency.propose(base);

        match &self.previous {
            Some(previous) => {
                debug!(fleet = %self.settings.fleet, desired = previous.desired_capacity, "stale snapshot, holding last target");
                ScaleDecision::NoChange(previous.clone())
            }
            None => {
                let target = self.hold_target(base, ScalingReason::Backlog, now);
                self.commit(target, base, now)
            }
        }
    }

    fn hold_target(&self, desired: u32, reason: ScalingReason, now: u64) -> ScalingTarget {
        ScalingTarget::clamped(
            &self.settings.fleet,
            desired,
            self.settings.min,
            self.settings.max,
            reason,
            now,
        )
    }

    fn in_cooldown(&self, now: u64) -> bool {
        self.last_change_at
            .is_some_and(|at| now.saturating_sub(at) < self.settings.warmup.as_secs())
    }

    fn commit(&mut self, target: ScalingTarget, base: u32, now: u64) -> ScaleDecision {
        self.previous = Some(target.clone());
        if target.desired_capacity == base {
            return ScaleDecision::NoChange(target);
        }

        self.last_change_at = Some(now);
        info!(
            fleet = %self.settings.fleet,
            from = base,
            to = target.desired_capacity,
            reason = %target.reason,
            "scaling target changed"
        );
        ScaleDecision::ScaleTo(target)
    }
}

/// Growth of more than 50% skips the cooldown. From zero, any growth does.
fn is_emergency(previous: u32, desired: u32) -> bool {
    desired as f64 > previous as f64 * 1.5
}
