//! voxscale-autoscale: the scaling decision engine.
//!
//! Turns one cycle's queue snapshot, latency aggregate, active scheduled
//! windows, and manual override into a single authoritative
//! `ScalingTarget`.
//!
//! # Decision Algorithm
//!
//! ```text
//! base = previous target's desired capacity (current capacity before the first)
//!
//! backlog:  age > target for ≥ 2 samples  →  base + ceil((age - target) / target)
//!           age < target for ≥ 3 samples  →  min(base, ceil(depth / per_worker_throughput))
//!           otherwise                     →  base
//!
//! latency:  p95 > 800ms for 5 periods     →  base + 1   (counter resets)
//!           p95 > 800ms this period       →  floor at base (no scale-in)
//!
//! schedule: active window with greatest desired → desired; its min/max replace
//!           the global bounds
//!
//! desired = clamp(max(backlog, latency, schedule), min, max)
//! ```
//!
//! A change of desired capacity inside `estimated_instance_warmup` of the
//! previous change is suppressed unless it grows capacity by more than
//! 50%. Stale snapshots hold the last valid target. An unexpired manual
//! override replaces the policy result and skips the cooldown.

pub mod engine;
pub mod policy;

pub use engine::{DecisionEngine, DecisionInputs, EngineSettings, ScaleDecision};
pub use policy::{BacklogPolicy, LatencyPolicy, Proposal, select_window};
