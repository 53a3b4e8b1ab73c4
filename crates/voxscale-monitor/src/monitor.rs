//! BacklogMonitor: samples the queue and aggregates latency once per tick.
//!
//! Queue and telemetry fetches run concurrently, each bounded by the
//! scrape timeout. A failed or slow queue fetch never blocks the loop:
//! the last-known snapshot is returned tagged `stale` and the staleness
//! counter advances. Telemetry failures only leave the latency window as
//! it was.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use voxscale_core::ControlConfig;
use voxscale_state::{HealthEvent, HealthEventKind, LatencySample, QueueSnapshot};

use crate::error::{MonitorError, MonitorResult};
use crate::latency::{LatencyAggregate, LatencyWindow};
use crate::source::{QueueReading, QueueSource, TelemetrySource};

/// Monitor knobs, usually derived from `voxscale.toml`.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub queue: String,
    pub fleet: String,
    pub namespace: String,
    pub metric_name: String,
    pub scrape_timeout: Duration,
    pub stale_threshold: u32,
    pub alarm_threshold: u32,
    pub latency_window: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            queue: config.queue.name.clone(),
            fleet: config.fleet.name.clone(),
            namespace: config.latency.namespace.clone(),
            metric_name: config.latency.metric_name.clone(),
            scrape_timeout: config.scrape_timeout(),
            stale_threshold: config.queue.stale_threshold,
            alarm_threshold: config.queue.alarm_threshold,
            latency_window: config.latency_window(),
        }
    }
}

/// Everything the monitor learned in one tick.
#[derive(Debug, Clone)]
pub struct Observation {
    pub snapshot: QueueSnapshot,
    pub latency: Option<LatencyAggregate>,
    pub events: Vec<HealthEvent>,
}

/// Counts consecutive stale samples and raises one event per threshold
/// crossing per episode.
#[derive(Debug, Clone)]
pub struct StalenessTracker {
    stale_threshold: u32,
    alarm_threshold: u32,
    consecutive: u32,
    degraded: bool,
    alarmed: bool,
}

impl StalenessTracker {
    pub fn new(stale_threshold: u32, alarm_threshold: u32) -> Self {
        Self {
            stale_threshold: stale_threshold.max(1),
            alarm_threshold: alarm_threshold.max(stale_threshold.max(1)),
            consecutive: 0,
            degraded: false,
            alarmed: false,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_stale(&mut self, now: u64) -> Vec<HealthEvent> {
        self.consecutive = self.consecutive.saturating_add(1);
        let mut events = Vec::new();

        if !self.degraded && self.consecutive >= self.stale_threshold {
            self.degraded = true;
            events.push(HealthEvent::new(
                now,
                HealthEventKind::HealthDegraded {
                    consecutive_stale: self.consecutive,
                },
            ));
        }
        if !self.alarmed && self.consecutive >= self.alarm_threshold {
            self.alarmed = true;
            events.push(HealthEvent::new(
                now,
                HealthEventKind::SourceAlarm {
                    consecutive_stale: self.consecutive,
                },
            ));
        }
        events
    }

    /// Reset the counter. Returns `SourceRecovered` if an episode was open.
    pub fn record_fresh(&mut self, now: u64) -> Option<HealthEvent> {
        let recovered = self.degraded;
        self.consecutive = 0;
        self.degraded = false;
        self.alarmed = false;
        recovered.then(|| HealthEvent::new(now, HealthEventKind::SourceRecovered))
    }
}

/// The backlog monitor for one queue/fleet pair.
pub struct BacklogMonitor {
    settings: MonitorSettings,
    queue: Arc<dyn QueueSource>,
    telemetry: Arc<dyn TelemetrySource>,
    last_snapshot: Option<QueueSnapshot>,
    staleness: StalenessTracker,
    latency: LatencyWindow,
    settle_next: bool,
    pending_events: Vec<HealthEvent>,
}

impl BacklogMonitor {
    pub fn new(
        settings: MonitorSettings,
        queue: Arc<dyn QueueSource>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Self {
        Self {
            staleness: StalenessTracker::new(settings.stale_threshold, settings.alarm_threshold),
            latency: LatencyWindow::new(settings.latency_window),
            settings,
            queue,
            telemetry,
            last_snapshot: None,
            settle_next: false,
            pending_events: Vec::new(),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn consecutive_stale(&self) -> u32 {
        self.staleness.consecutive()
    }

    pub fn last_snapshot(&self) -> Option<&QueueSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// The next fresh sample follows a capacity change and is tagged
    /// `settling`.
    pub fn note_fleet_changed(&mut self) {
        self.settle_next = true;
    }

    /// Sample the queue only. Health events raised here are returned by
    /// the next [`observe`](Self::observe) or [`take_events`](Self::take_events).
    pub async fn sample(&mut self, now: u64) -> QueueSnapshot {
        let result = fetch_queue(
            self.queue.as_ref(),
            &self.settings.queue,
            self.settings.scrape_timeout,
        )
        .await;
        self.record_queue(result, now)
    }

    /// Sample the queue and telemetry concurrently.
    pub async fn observe(&mut self, now: u64) -> Observation {
        let timeout = self.settings.scrape_timeout;
        let (queue_result, telemetry_result) = tokio::join!(
            fetch_queue(self.queue.as_ref(), &self.settings.queue, timeout),
            fetch_latency(self.telemetry.as_ref(), &self.settings, timeout),
        );

        let snapshot = self.record_queue(queue_result, now);

        match telemetry_result {
            Ok(readings) => {
                let accepted = self.latency.ingest(readings);
                debug!(fleet = %self.settings.fleet, accepted, "latency readings ingested");
            }
            Err(e) => {
                warn!(
                    fleet = %self.settings.fleet,
                    error = %e,
                    "telemetry fetch failed, keeping previous latency window"
                );
            }
        }
        let latency = self.latency.aggregate(now);

        Observation {
            snapshot,
            latency,
            events: self.take_events(),
        }
    }

    pub fn take_events(&mut self) -> Vec<HealthEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn record_queue(&mut self, result: MonitorResult<QueueReading>, now: u64) -> QueueSnapshot {
        match result {
            Ok(reading) => {
                let mut snapshot = QueueSnapshot::new(
                    &self.settings.queue,
                    reading.depth,
                    reading.oldest_message_age_seconds,
                    now,
                );
                if self.settle_next {
                    snapshot.settling = true;
                    self.settle_next = false;
                }
                if let Some(event) = self.staleness.record_fresh(now) {
                    info!(queue = %self.settings.queue, "queue source recovered");
                    self.pending_events.push(event);
                }
                debug!(
                    queue = %self.settings.queue,
                    depth = snapshot.depth,
                    oldest_age = snapshot.oldest_age_seconds,
                    settling = snapshot.settling,
                    "queue sampled"
                );
                self.last_snapshot = Some(snapshot.clone());
                snapshot
            }
            Err(e) => {
                let events = self.staleness.record_stale(now);
                warn!(
                    queue = %self.settings.queue,
                    error = %e,
                    consecutive_stale = self.staleness.consecutive(),
                    "queue sample failed, reusing last-known snapshot"
                );
                for event in &events {
                    warn!(queue = %self.settings.queue, event = event.kind.name(), "queue source health");
                }
                self.pending_events.extend(events);

                match &self.last_snapshot {
                    Some(last) => QueueSnapshot {
                        stale: true,
                        settling: false,
                        ..last.clone()
                    },
                    None => QueueSnapshot::unknown(&self.settings.queue, now),
                }
            }
        }
    }
}

async fn fetch_queue(
    source: &dyn QueueSource,
    queue: &str,
    timeout: Duration,
) -> MonitorResult<QueueReading> {
    let reading = tokio::time::timeout(timeout, source.queue_depth(queue))
        .await
        .map_err(|_| MonitorError::Timeout(timeout))??;

    let age = reading.oldest_message_age_seconds;
    if !age.is_finite() || age < 0.0 {
        return Err(MonitorError::InvalidReading(format!(
            "oldest_message_age_seconds = {age}"
        )));
    }
    Ok(reading)
}

async fn fetch_latency(
    source: &dyn TelemetrySource,
    settings: &MonitorSettings,
    timeout: Duration,
) -> MonitorResult<Vec<LatencySample>> {
    tokio::time::timeout(
        timeout,
        source.latency(&settings.fleet, &settings.namespace, &settings.metric_name),
    )
    .await
    .map_err(|_| MonitorError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{InMemoryQueue, InMemoryTelemetry};
    use voxscale_state::LatencyMetric;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            queue: "story-tasks".to_string(),
            fleet: "gpu-workers".to_string(),
            namespace: "voxscale".to_string(),
            metric_name: "ttfa".to_string(),
            scrape_timeout: Duration::from_millis(100),
            stale_threshold: 3,
            alarm_threshold: 10,
            latency_window: Duration::from_secs(300),
        }
    }

    fn monitor() -> (BacklogMonitor, InMemoryQueue, InMemoryTelemetry) {
        let queue = InMemoryQueue::new();
        let telemetry = InMemoryTelemetry::new();
        let monitor = BacklogMonitor::new(
            settings(),
            Arc::new(queue.clone()),
            Arc::new(telemetry.clone()),
        );
        (monitor, queue, telemetry)
    }

    fn kinds(events: &[HealthEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind.name()).collect()
    }

    #[tokio::test]
    async fn fresh_sample() {
        let (mut monitor, queue, _) = monitor();
        queue.set(5, 2.5);

        let snap = monitor.sample(100).await;
        assert_eq!(snap.depth, 5);
        assert_eq!(snap.oldest_age_seconds, 2.5);
        assert_eq!(snap.sampled_at, 100);
        assert!(snap.is_actionable());
    }

    #[tokio::test]
    async fn failure_returns_last_known_tagged_stale() {
        let (mut monitor, queue, _) = monitor();
        queue.set(5, 2.5);
        monitor.sample(100).await;

        queue.set_unavailable(true);
        let snap = monitor.sample(160).await;
        assert!(snap.stale);
        assert_eq!(snap.depth, 5);
        assert_eq!(snap.sampled_at, 100);
        assert_eq!(monitor.consecutive_stale(), 1);
    }

    #[tokio::test]
    async fn failure_before_any_sample_is_unknown() {
        let (mut monitor, queue, _) = monitor();
        queue.set_unavailable(true);

        let snap = monitor.sample(100).await;
        assert!(snap.stale);
        assert_eq!(snap.depth, 0);
    }

    #[tokio::test]
    async fn slow_source_times_out_as_stale() {
        let (mut monitor, queue, _) = monitor();
        queue.set(5, 2.5);
        queue.set_delay(Some(Duration::from_millis(500)));

        let snap = monitor.sample(100).await;
        assert!(snap.stale);
    }

    #[tokio::test]
    async fn three_stale_samples_degrade_once() {
        let (mut monitor, queue, _) = monitor();
        queue.set_unavailable(true);

        let mut raised = Vec::new();
        for t in 0..5 {
            monitor.sample(t * 60).await;
            raised.extend(monitor.take_events());
        }
        assert_eq!(kinds(&raised), vec!["health_degraded"]);
        assert_eq!(raised[0].at, 120);
    }

    #[tokio::test]
    async fn persistent_failure_raises_alarm_then_recovers() {
        let (mut monitor, queue, _) = monitor();
        queue.set(1, 0.0);
        queue.set_unavailable(true);

        let mut raised = Vec::new();
        for t in 0..12 {
            raised.extend(monitor.observe(t).await.events);
        }
        assert_eq!(kinds(&raised), vec!["health_degraded", "source_alarm"]);

        queue.set_unavailable(false);
        let obs = monitor.observe(12).await;
        assert_eq!(kinds(&obs.events), vec!["source_recovered"]);
        assert_eq!(monitor.consecutive_stale(), 0);
    }

    #[tokio::test]
    async fn short_outage_recovers_silently() {
        let (mut monitor, queue, _) = monitor();
        queue.set(1, 0.0);
        queue.set_unavailable(true);
        monitor.observe(0).await;
        queue.set_unavailable(false);

        let obs = monitor.observe(60).await;
        assert!(obs.events.is_empty());
    }

    #[tokio::test]
    async fn fleet_change_marks_next_fresh_sample_settling() {
        let (mut monitor, queue, _) = monitor();
        queue.set(5, 2.5);
        monitor.note_fleet_changed();

        // A stale sample does not consume the settling mark.
        queue.set_unavailable(true);
        assert!(!monitor.sample(0).await.settling);

        queue.set_unavailable(false);
        let first = monitor.sample(60).await;
        assert!(first.settling);
        assert!(!first.is_actionable());

        let second = monitor.sample(120).await;
        assert!(!second.settling);
    }

    #[tokio::test]
    async fn observe_aggregates_latency() {
        let (mut monitor, queue, telemetry) = monitor();
        queue.set(0, 0.0);
        telemetry.record(LatencyMetric::P95, 900.0, 50);
        telemetry.record(LatencyMetric::P50, 400.0, 50);

        let obs = monitor.observe(60).await;
        let agg = obs.latency.unwrap();
        assert_eq!(agg.p95_ms, Some(900.0));
        assert_eq!(agg.p50_ms, Some(400.0));

        // Telemetry outage keeps the window.
        telemetry.set_unavailable(true);
        let obs = monitor.observe(120).await;
        assert_eq!(obs.latency.unwrap().p95_ms, Some(900.0));
    }

    #[tokio::test]
    async fn negative_age_is_rejected() {
        let (mut monitor, queue, _) = monitor();
        queue.set(1, -4.0);
        assert!(monitor.sample(0).await.stale);
    }

    #[test]
    fn tracker_thresholds_are_sane() {
        let tracker = StalenessTracker::new(0, 0);
        assert_eq!(tracker.stale_threshold, 1);
        assert_eq!(tracker.alarm_threshold, 1);
    }
}
