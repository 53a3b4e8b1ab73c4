//! Collaborator traits for the queue service and the telemetry sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use voxscale_state::{LatencyMetric, LatencySample};

use crate::error::{MonitorError, MonitorResult};

/// Raw queue attributes as reported by the queue service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueReading {
    pub depth: u64,
    pub oldest_message_age_seconds: f64,
}

/// A queue service that reports depth and oldest-message age per named queue.
#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn queue_depth(&self, queue: &str) -> MonitorResult<QueueReading>;
}

/// A telemetry sink holding per-fleet TTFA percentiles.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Readings tagged with `namespace`/`metric_name` for `fleet`.
    ///
    /// Implementations may return readings already seen on a previous
    /// call; the latency window discards duplicates.
    async fn latency(
        &self,
        fleet: &str,
        namespace: &str,
        metric_name: &str,
    ) -> MonitorResult<Vec<LatencySample>>;
}

// ── In-memory queue ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct QueueInner {
    reading: Option<QueueReading>,
    unavailable: bool,
    delay: Option<Duration>,
}

/// Scriptable queue source. Clones share state, so a test can keep a
/// handle while the monitor owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, depth: u64, oldest_message_age_seconds: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.reading = Some(QueueReading {
                depth,
                oldest_message_age_seconds,
            });
        }
    }

    /// Make every subsequent call fail with `SourceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Delay every response, e.g. past the scrape timeout.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.delay = delay;
        }
    }

    pub fn reading(&self) -> Option<QueueReading> {
        self.inner.lock().ok().and_then(|inner| inner.reading)
    }

    /// Remove one message. Returns false on an empty queue.
    pub fn take_one(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.reading.as_mut() {
            Some(reading) if reading.depth > 0 => {
                reading.depth -= 1;
                if reading.depth == 0 {
                    reading.oldest_message_age_seconds = 0.0;
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl QueueSource for InMemoryQueue {
    async fn queue_depth(&self, queue: &str) -> MonitorResult<QueueReading> {
        let (reading, unavailable, delay) = {
            let inner = self
                .inner
                .lock()
                .map_err(|e| MonitorError::SourceUnavailable(e.to_string()))?;
            (inner.reading, inner.unavailable, inner.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(MonitorError::SourceUnavailable(format!(
                "queue {queue} is unreachable"
            )));
        }
        reading.ok_or_else(|| MonitorError::NotFound(queue.to_string()))
    }
}

// ── In-memory telemetry ───────────────────────────────────────────

#[derive(Debug, Default)]
struct TelemetryInner {
    pending: Vec<LatencySample>,
    unavailable: bool,
}

/// Telemetry sink fed by the caller. Each read drains what was recorded.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: LatencyMetric, value_ms: f64, sampled_at: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pending.push(LatencySample {
                metric,
                value_ms,
                sampled_at,
            });
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }
}

#[async_trait]
impl TelemetrySource for InMemoryTelemetry {
    async fn latency(
        &self,
        fleet: &str,
        _namespace: &str,
        _metric_name: &str,
    ) -> MonitorResult<Vec<LatencySample>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| MonitorError::SourceUnavailable(e.to_string()))?;
        if inner.unavailable {
            return Err(MonitorError::SourceUnavailable(format!(
                "telemetry for {fleet} is unreachable"
            )));
        }
        Ok(std::mem::take(&mut inner.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_reports_configured_reading() {
        let queue = InMemoryQueue::new();
        queue.set(12, 3.5);

        let reading = queue.queue_depth("story-tasks").await.unwrap();
        assert_eq!(reading.depth, 12);
        assert_eq!(reading.oldest_message_age_seconds, 3.5);
    }

    #[test]
    fn take_one_drains_to_empty() {
        let queue = InMemoryQueue::new();
        assert!(!queue.take_one());
        queue.set(2, 9.0);
        assert!(queue.take_one());
        assert!(queue.take_one());
        assert!(!queue.take_one());
        let reading = queue.reading().unwrap();
        assert_eq!(reading.depth, 0);
        assert_eq!(reading.oldest_message_age_seconds, 0.0);
    }

    #[tokio::test]
    async fn queue_without_reading_is_not_found() {
        let queue = InMemoryQueue::new();
        let err = queue.queue_depth("story-tasks").await.unwrap_err();
        assert!(matches!(err, MonitorError::NotFound(_)));
    }

    #[tokio::test]
    async fn unavailable_queue_fails() {
        let queue = InMemoryQueue::new();
        queue.set(1, 0.0);
        let handle = queue.clone();
        handle.set_unavailable(true);

        let err = queue.queue_depth("story-tasks").await.unwrap_err();
        assert!(matches!(err, MonitorError::SourceUnavailable(_)));

        handle.set_unavailable(false);
        assert!(queue.queue_depth("story-tasks").await.is_ok());
    }

    #[tokio::test]
    async fn telemetry_drains_on_read() {
        let telemetry = InMemoryTelemetry::new();
        telemetry.record(LatencyMetric::P95, 900.0, 10);
        telemetry.record(LatencyMetric::P50, 400.0, 10);

        let first = telemetry.latency("gpu", "voxscale", "ttfa").await.unwrap();
        assert_eq!(first.len(), 2);

        let second = telemetry.latency("gpu", "voxscale", "ttfa").await.unwrap();
        assert!(second.is_empty());
    }
}
