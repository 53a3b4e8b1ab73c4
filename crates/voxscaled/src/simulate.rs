//! `voxscaled simulate`: the real control loop against a modelled queue
//! and fleet, on a virtual clock.
//!
//! Each cycle the queue receives `rate × interval` messages and every
//! in-service worker drains `worker_rate × interval`. Instances launched
//! in one cycle come into service in the next. TTFA grows with the age of
//! the oldest message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use voxscale_control::{Collaborators, ControlLoop, fallback_consumer};
use voxscale_core::ControlConfig;
use voxscale_core::config::{FallbackConfig, FallbackKind};
use voxscale_fleet::{DrainFn, SimulatedFleet};
use voxscale_monitor::{InMemoryQueue, InMemoryTelemetry};
use voxscale_state::{LatencyMetric, StateStore};

/// TTFA with an empty queue.
const BASE_TTFA_MS: f64 = 450.0;
/// Added TTFA per second of oldest-message age.
const TTFA_PER_AGE_SEC_MS: f64 = 40.0;

#[derive(Debug, Clone)]
pub struct Workload {
    pub base_rate: f64,
    pub peak_rate: f64,
    pub peak_start: u32,
    pub peak_cycles: u32,
    pub worker_rate: f64,
}

impl Workload {
    fn arrival_rate(&self, cycle: u32) -> f64 {
        let peak = cycle >= self.peak_start && cycle < self.peak_start + self.peak_cycles;
        if peak { self.peak_rate } else { self.base_rate }
    }
}

/// Two-worker fleet with a CPU-mock fallback.
pub fn default_config() -> ControlConfig {
    let mut config = ControlConfig::scaffold("story-tasks", "gpu-workers", 0, 2);
    config.fallback = Some(FallbackConfig {
        kind: FallbackKind::CpuMock,
        address: None,
        mock_min_ms: 300,
        mock_max_ms: 800,
    });
    config
}

/// Queue model state between cycles.
struct QueueModel {
    depth: f64,
    age_secs: f64,
}

impl QueueModel {
    fn advance(&mut self, arrivals: f64, drain_capacity: f64, dt: f64) {
        let before = self.depth;
        self.depth = (self.depth + arrivals - drain_capacity).max(0.0);
        self.age_secs = if self.depth < 1.0 {
            0.0
        } else if drain_capacity > 0.0 {
            // Messages ahead of the newest arrivals wait depth / drain rate.
            self.depth / (drain_capacity / dt)
        } else if before < 1.0 {
            dt
        } else {
            self.age_secs + dt
        };
    }
}

pub async fn run(config: &ControlConfig, workload: &Workload, cycles: u32) -> anyhow::Result<()> {
    let store = StateStore::open_in_memory()?;
    let queue = InMemoryQueue::new();
    let telemetry = InMemoryTelemetry::new();
    let fleet = SimulatedFleet::new(config.fleet.min);
    fleet.set_hold_pending(true);

    let interval = config.sample_interval().as_secs().max(1);
    let dt = interval as f64;
    let timeout = config.scrape_timeout();

    let fallback = config.fallback.as_ref().map(|f| {
        let handle = queue.clone();
        let drain: DrainFn = Arc::new(move || handle.take_one());
        fallback_consumer(f, timeout, Some(drain))
    });

    let mut control = ControlLoop::from_config(
        config,
        store.clone(),
        Collaborators {
            queue: Arc::new(queue.clone()),
            telemetry: Arc::new(telemetry.clone()),
            fleet: Arc::new(fleet.clone()),
            fallback,
        },
    )?;

    info!(
        cycles,
        interval_secs = interval,
        min = config.fleet.min,
        max = config.fleet.max,
        "simulation starting"
    );

    let start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut model = QueueModel {
        depth: 0.0,
        age_secs: 0.0,
    };
    let mut peak_capacity = 0;

    for cycle in 0..cycles {
        let now = start + u64::from(cycle) * interval;
        fleet.set_clock(now);

        let in_service = control.fleet_state().in_service;
        let arrivals = workload.arrival_rate(cycle) * dt;
        let drain_capacity = f64::from(in_service) * workload.worker_rate * dt;
        model.advance(arrivals, drain_capacity, dt);

        queue.set(model.depth.round() as u64, model.age_secs);
        telemetry.record(
            LatencyMetric::P95,
            BASE_TTFA_MS + TTFA_PER_AGE_SEC_MS * model.age_secs,
            now,
        );

        let report = control.tick(now).await?;
        fleet.promote_pending();
        peak_capacity = peak_capacity.max(report.fleet.current_capacity);

        // The fallback consumer may have drained part of the queue.
        if let Some(reading) = queue.reading() {
            model.depth = model.depth.min(reading.depth as f64);
        }

        let target = report.decision.target();
        info!(
            cycle,
            depth = report.snapshot.depth,
            age = report.snapshot.oldest_age_seconds,
            desired = target.desired_capacity,
            reason = %target.reason,
            capacity = report.fleet.current_capacity,
            in_service = report.fleet.in_service,
            health = ?report.status.capacity_health,
            events = report.events.len(),
            "cycle"
        );
    }

    control.stop().await;

    let mut by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
    for event in store.list_events(usize::MAX)? {
        *by_kind.entry(event.kind.name()).or_default() += 1;
    }
    info!(peak_capacity, events = ?by_kind, "simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrival_rate_follows_peak() {
        let workload = Workload {
            base_rate: 0.5,
            peak_rate: 4.0,
            peak_start: 2,
            peak_cycles: 3,
            worker_rate: 1.0,
        };
        assert_eq!(workload.arrival_rate(1), 0.5);
        assert_eq!(workload.arrival_rate(2), 4.0);
        assert_eq!(workload.arrival_rate(4), 4.0);
        assert_eq!(workload.arrival_rate(5), 0.5);
    }

    #[test]
    fn queue_ages_without_workers() {
        let mut model = QueueModel {
            depth: 0.0,
            age_secs: 0.0,
        };
        model.advance(30.0, 0.0, 60.0);
        assert_eq!(model.depth, 30.0);
        assert_eq!(model.age_secs, 60.0);
        model.advance(30.0, 0.0, 60.0);
        assert_eq!(model.age_secs, 120.0);
    }

    #[test]
    fn workers_drain_queue() {
        let mut model = QueueModel {
            depth: 100.0,
            age_secs: 120.0,
        };
        model.advance(10.0, 120.0, 60.0);
        assert_eq!(model.depth, 0.0);
        assert_eq!(model.age_secs, 0.0);
    }

    #[tokio::test]
    async fn short_simulation_runs() {
        let workload = Workload {
            base_rate: 0.0,
            peak_rate: 2.0,
            peak_start: 0,
            peak_cycles: 4,
            worker_rate: 1.0,
        };
        run(&default_config(), &workload, 6).await.unwrap();
    }
}
