//! The individual scaling policies.
//!
//! Each policy is a small state machine over consecutive evaluation
//! periods. None of them clamp; the engine applies bounds once, after the
//! proposals are combined.

use voxscale_core::ScheduledCapacity;
use voxscale_state::{QueueSnapshot, ScalingReason};

/// A capacity proposed by one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub reason: ScalingReason,
    pub desired: u32,
}

impl Proposal {
    pub fn new(reason: ScalingReason, desired: u32) -> Self {
        Self { reason, desired }
    }
}

/// Target tracking on the age of the oldest queued message.
#[derive(Debug, Clone)]
pub struct BacklogPolicy {
    target_age_secs: f64,
    scale_out_periods: u32,
    scale_in_periods: u32,
    per_worker_throughput: f64,
    above: u32,
    below: u32,
}

impl BacklogPolicy {
    pub fn new(
        target_age_secs: f64,
        scale_out_periods: u32,
        scale_in_periods: u32,
        per_worker_throughput: f64,
    ) -> Self {
        Self {
            target_age_secs,
            scale_out_periods: scale_out_periods.max(1),
            scale_in_periods: scale_in_periods.max(1),
            per_worker_throughput,
            above: 0,
            below: 0,
        }
    }

    /// Consecutive samples above the target age.
    pub fn above(&self) -> u32 {
        self.above
    }

    /// Consecutive samples below the target age.
    pub fn below(&self) -> u32 {
        self.below
    }

    /// Count a snapshot. Stale and settling snapshots are skipped without
    /// breaking a streak.
    pub fn observe(&mut self, snapshot: &QueueSnapshot) {
        if !snapshot.is_actionable() {
            return;
        }
        let age = snapshot.oldest_age_seconds;
        if age > self.target_age_secs {
            self.above = self.above.saturating_add(1);
            self.below = 0;
        } else if age < self.target_age_secs {
            self.below = self.below.saturating_add(1);
            self.above = 0;
        } else {
            self.above = 0;
            self.below = 0;
        }
    }

    /// Proposal for the latest observed snapshot. A snapshot that is not
    /// actionable holds `base`.
    pub fn propose(&self, snapshot: &QueueSnapshot, base: u32) -> u32 {
        if !snapshot.is_actionable() {
            return base;
        }
        if self.above >= self.scale_out_periods {
            let excess = snapshot.oldest_age_seconds - self.target_age_secs;
            let step = (excess / self.target_age_secs).ceil().max(1.0);
            return base.saturating_add(to_u32(step));
        }
        if self.below >= self.scale_in_periods {
            let needed = (snapshot.depth as f64 / self.per_worker_throughput).ceil();
            return base.min(to_u32(needed));
        }
        base
    }
}

/// The TTFA safety valve. Only ever adds capacity.
#[derive(Debug, Clone)]
pub struct LatencyPolicy {
    threshold_ms: f64,
    evaluation_periods: u32,
    breaches: u32,
    breaching: bool,
}

impl LatencyPolicy {
    pub fn new(threshold_ms: f64, evaluation_periods: u32) -> Self {
        Self {
            threshold_ms,
            evaluation_periods: evaluation_periods.max(1),
            breaches: 0,
            breaching: false,
        }
    }

    /// Consecutive breaching periods since the last firing.
    pub fn breaches(&self) -> u32 {
        self.breaches
    }

    /// Whether the most recent period breached the threshold.
    pub fn is_breaching(&self) -> bool {
        self.breaching
    }

    /// Count one evaluation period. A missing aggregate ends the streak.
    pub fn observe(&mut self, p95_ms: Option<f64>) {
        self.breaching = p95_ms.is_some_and(|p95| p95 > self.threshold_ms);
        if self.breaching {
            self.breaches = self.breaches.saturating_add(1);
        } else {
            self.breaches = 0;
        }
    }

    /// `base + 1` once the streak reaches the evaluation periods, `base`
    /// while breaching (blocks scale-in), otherwise nothing.
    pub fn propose(&mut self, base: u32) -> Option<u32> {
        if self.breaches >= self.evaluation_periods {
            self.breaches = 0;
            return Some(base.saturating_add(1));
        }
        self.breaching.then_some(base)
    }
}

/// The active window with the greatest desired capacity; the first in
/// config order wins ties.
pub fn select_window(active: &[ScheduledCapacity]) -> Option<&ScheduledCapacity> {
    active.iter().fold(None, |best: Option<&ScheduledCapacity>, w| match best {
        Some(b) if b.desired >= w.desired => Some(b),
        _ => Some(w),
    })
}

fn to_u32(v: f64) -> u32 {
    if v.is_finite() && v > 0.0 {
        v.min(u32::MAX as f64) as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(depth: u64, age: f64) -> QueueSnapshot {
        QueueSnapshot::new("story-tasks", depth, age, 0)
    }

    fn backlog() -> BacklogPolicy {
        BacklogPolicy::new(4.0, 2, 3, 20.0)
    }

    #[test]
    fn scale_out_needs_two_periods() {
        let mut policy = backlog();
        let s = snap(30, 12.0);

        policy.observe(&s);
        assert_eq!(policy.propose(&s, 1), 1);

        policy.observe(&s);
        // ceil((12 - 4) / 4) = 2
        assert_eq!(policy.propose(&s, 1), 3);
    }

    #[test]
    fn scale_out_step_is_at_least_one() {
        let mut policy = backlog();
        let s = snap(1, 4.1);
        policy.observe(&s);
        policy.observe(&s);
        assert_eq!(policy.propose(&s, 0), 1);
    }

    #[test]
    fn scale_in_needs_three_periods() {
        let mut policy = backlog();
        let s = snap(0, 0.0);

        for _ in 0..2 {
            policy.observe(&s);
            assert_eq!(policy.propose(&s, 2), 2);
        }
        policy.observe(&s);
        assert_eq!(policy.propose(&s, 2), 0);
    }

    #[test]
    fn scale_in_keeps_enough_workers_for_depth() {
        let mut policy = backlog();
        let s = snap(50, 1.0);
        for _ in 0..3 {
            policy.observe(&s);
        }
        // ceil(50 / 20) = 3, but never above base.
        assert_eq!(policy.propose(&s, 5), 3);
        assert_eq!(policy.propose(&s, 2), 2);
    }

    #[test]
    fn direction_change_resets_streak() {
        let mut policy = backlog();
        policy.observe(&snap(0, 0.0));
        policy.observe(&snap(0, 0.0));
        policy.observe(&snap(10, 9.0));
        assert_eq!(policy.below(), 0);
        assert_eq!(policy.above(), 1);
    }

    #[test]
    fn stale_and_settling_samples_do_not_count() {
        let mut policy = backlog();
        policy.observe(&snap(0, 0.0));

        let mut stale = snap(10, 9.0);
        stale.stale = true;
        policy.observe(&stale);

        let mut settling = snap(10, 9.0);
        settling.settling = true;
        policy.observe(&settling);

        assert_eq!(policy.below(), 1);
        assert_eq!(policy.above(), 0);
        assert_eq!(policy.propose(&settling, 3), 3);
    }

    #[test]
    fn latency_fires_after_five_periods_then_resets() {
        let mut policy = LatencyPolicy::new(800.0, 5);
        for _ in 0..4 {
            policy.observe(Some(900.0));
            assert_eq!(policy.propose(2), Some(2));
        }
        policy.observe(Some(900.0));
        assert_eq!(policy.propose(2), Some(3));
        assert_eq!(policy.breaches(), 0);
    }

    #[test]
    fn latency_quiet_below_threshold() {
        let mut policy = LatencyPolicy::new(800.0, 5);
        policy.observe(Some(900.0));
        policy.observe(Some(800.0));
        assert_eq!(policy.propose(2), None);
        assert_eq!(policy.breaches(), 0);
    }

    #[test]
    fn missing_latency_resets_streak() {
        let mut policy = LatencyPolicy::new(800.0, 5);
        for _ in 0..4 {
            policy.observe(Some(900.0));
        }
        policy.observe(None);
        assert_eq!(policy.breaches(), 0);
        assert!(!policy.is_breaching());
    }

    #[test]
    fn window_selection_prefers_greatest_then_first() {
        let w = |name: &str, desired| ScheduledCapacity {
            name: name.to_string(),
            min: 0,
            max: 4,
            desired,
        };
        let active = vec![w("a", 1), w("b", 3), w("c", 3)];
        assert_eq!(select_window(&active).unwrap().name, "b");
        assert!(select_window(&[]).is_none());
    }
}
