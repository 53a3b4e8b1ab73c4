//! Domain types for the voxscale control loop.
//!
//! All timestamps are unix seconds. Every type round-trips through JSON
//! for storage in redb tables and for the operator API.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a worker fleet (autoscaling group).
pub type FleetName = String;

/// Identifier reported by a worker.
pub type WorkerId = String;

// ── Queue ─────────────────────────────────────────────────────────

/// Point-in-time view of the work queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub queue: String,
    /// Messages waiting for a worker.
    pub depth: u64,
    /// Age of the oldest waiting message.
    pub oldest_age_seconds: f64,
    pub sampled_at: u64,
    /// Last-known snapshot reused after a sampling failure.
    #[serde(default)]
    pub stale: bool,
    /// First sample after a fleet change; depth movement may be self-induced.
    #[serde(default)]
    pub settling: bool,
}

impl QueueSnapshot {
    /// A fresh snapshot.
    pub fn new(queue: &str, depth: u64, oldest_age_seconds: f64, sampled_at: u64) -> Self {
        Self {
            queue: queue.to_string(),
            depth,
            oldest_age_seconds: oldest_age_seconds.max(0.0),
            sampled_at,
            stale: false,
            settling: false,
        }
    }

    /// Placeholder used when a source fails before anything was sampled.
    pub fn unknown(queue: &str, sampled_at: u64) -> Self {
        Self {
            stale: true,
            ..Self::new(queue, 0, 0.0, sampled_at)
        }
    }

    /// Whether the engine may act on this snapshot's backlog signal.
    pub fn is_actionable(&self) -> bool {
        !self.stale && !self.settling
    }

    /// Build the composite key for the snapshots table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.queue, self.sampled_at)
    }
}

// ── Latency ───────────────────────────────────────────────────────

/// Which percentile a latency reading represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMetric {
    P50,
    P95,
}

/// A time-to-first-audio reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencySample {
    pub metric: LatencyMetric,
    pub value_ms: f64,
    pub sampled_at: u64,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Which policy produced a scaling target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingReason {
    Backlog,
    LatencySlo,
    Schedule,
    Manual,
}

impl fmt::Display for ScalingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalingReason::Backlog => "backlog",
            ScalingReason::LatencySlo => "latency_slo",
            ScalingReason::Schedule => "schedule",
            ScalingReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// The authoritative desired fleet size for one decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingTarget {
    pub fleet: FleetName,
    /// Always within `[min, max]`.
    pub desired_capacity: u32,
    pub min: u32,
    pub max: u32,
    pub reason: ScalingReason,
    pub computed_at: u64,
}

impl ScalingTarget {
    /// Build a target, clamping `desired` into `[min, max]`.
    pub fn clamped(
        fleet: &str,
        desired: u32,
        min: u32,
        max: u32,
        reason: ScalingReason,
        computed_at: u64,
    ) -> Self {
        let max = max.max(min);
        Self {
            fleet: fleet.to_string(),
            desired_capacity: desired.clamp(min, max),
            min,
            max,
            reason,
            computed_at,
        }
    }

    /// Build the composite key for the targets table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.fleet, self.computed_at)
    }
}

// ── Fleet ─────────────────────────────────────────────────────────

/// Capacity bookkeeping for a worker fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetState {
    pub fleet: FleetName,
    /// Desired capacity last accepted by the provider.
    pub current_capacity: u32,
    /// Instances serving work.
    pub in_service: u32,
    /// Instances launching.
    pub pending: u32,
    /// Scale-in is blocked because workers report active renders.
    pub protected_from_scale_in: bool,
    pub updated_at: u64,
}

impl FleetState {
    pub fn new(fleet: &str, current_capacity: u32, updated_at: u64) -> Self {
        Self {
            fleet: fleet.to_string(),
            current_capacity,
            in_service: current_capacity,
            pending: 0,
            protected_from_scale_in: false,
            updated_at,
        }
    }

    /// Capacity that is desired but not yet serving.
    pub fn shortfall(&self) -> u32 {
        self.current_capacity.saturating_sub(self.in_service)
    }
}

/// In-flight render count reported by one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveJobSignal {
    pub worker_id: WorkerId,
    pub active_render_count: u32,
    pub reported_at: u64,
}

/// Operator-requested capacity that replaces the policy result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualOverride {
    pub desired: u32,
    /// `None` holds until cleared.
    pub expires_at: Option<u64>,
    pub requested_at: u64,
}

impl ManualOverride {
    pub fn is_active(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Whether GPU capacity is keeping up with the desired fleet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityHealth {
    Healthy,
    /// In-service capacity is short of desired past the grace period.
    Shortfall,
    /// Shortfall with the fallback consumer draining the queue.
    Fallback,
}

/// Per-cycle status summary published for operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlStatus {
    pub fleet: FleetName,
    pub capacity_health: CapacityHealth,
    /// Consecutive stale queue samples.
    pub consecutive_stale: u32,
    pub latency_p95_ms: Option<f64>,
    /// max(30s, 2 × p95 synthesis time).
    pub recommended_visibility_timeout_secs: u64,
    pub active_renders: u32,
    /// At least one in-service worker is healthy.
    #[serde(default)]
    pub gpu_available: bool,
    /// When desired capacity last changed; restores the cooldown on restart.
    #[serde(default)]
    pub last_change_at: Option<u64>,
    pub updated_at: u64,
}

// ── Health events ─────────────────────────────────────────────────

/// Operator-visible event raised by the control loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthEvent {
    pub at: u64,
    #[serde(flatten)]
    pub kind: HealthEventKind,
}

impl HealthEvent {
    pub fn new(at: u64, kind: HealthEventKind) -> Self {
        Self { at, kind }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEventKind {
    /// The queue source failed `consecutive_stale` samples in a row.
    HealthDegraded { consecutive_stale: u32 },
    /// Stale sampling persisted past the alarm threshold.
    SourceAlarm { consecutive_stale: u32 },
    /// A fresh sample arrived after degradation.
    SourceRecovered,
    /// GPU capacity cannot reach the desired size.
    CapacityShortfall {
        desired: u32,
        in_service: u32,
        cause: String,
    },
    /// In-service capacity caught up with the desired size.
    CapacityRestored { in_service: u32 },
    /// The fleet's capacity changed.
    FleetChanged { before: u32, after: u32 },
    FallbackActivated,
    FallbackDeactivated,
}

impl HealthEventKind {
    /// Short name used in logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            HealthEventKind::HealthDegraded { .. } => "health_degraded",
            HealthEventKind::SourceAlarm { .. } => "source_alarm",
            HealthEventKind::SourceRecovered => "source_recovered",
            HealthEventKind::CapacityShortfall { .. } => "capacity_shortfall",
            HealthEventKind::CapacityRestored { .. } => "capacity_restored",
            HealthEventKind::FleetChanged { .. } => "fleet_changed",
            HealthEventKind::FallbackActivated => "fallback_activated",
            HealthEventKind::FallbackDeactivated => "fallback_deactivated",
        }
    }
}
