//! Rolling time-to-first-audio aggregate.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxscale_state::{LatencyMetric, LatencySample};

/// Floor for the recommended queue visibility timeout.
const MIN_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Percentiles over the current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyAggregate {
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    /// Readings in the window.
    pub samples: usize,
    pub computed_at: u64,
}

/// Telemetry readings retained for a fixed window.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    window: Duration,
    samples: VecDeque<LatencySample>,
}

impl LatencyWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add readings, returning how many were accepted.
    ///
    /// A reading is accepted only if it is newer than the newest retained
    /// reading of the same metric and its value is a finite, non-negative
    /// number of milliseconds.
    pub fn ingest(&mut self, readings: impl IntoIterator<Item = LatencySample>) -> usize {
        let mut newest_p50 = self.newest(LatencyMetric::P50);
        let mut newest_p95 = self.newest(LatencyMetric::P95);

        let mut accepted = 0;
        for sample in readings {
            if !sample.value_ms.is_finite() || sample.value_ms < 0.0 {
                continue;
            }
            let newest = match sample.metric {
                LatencyMetric::P50 => &mut newest_p50,
                LatencyMetric::P95 => &mut newest_p95,
            };
            if newest.is_some_and(|at| sample.sampled_at <= at) {
                continue;
            }
            *newest = Some(sample.sampled_at);
            self.samples.push_back(sample);
            accepted += 1;
        }
        accepted
    }

    /// Drop readings that fell out of the window ending at `now`.
    pub fn evict(&mut self, now: u64) {
        let Some(cutoff) = now.checked_sub(self.window.as_secs()) else {
            return;
        };
        self.samples.retain(|s| s.sampled_at > cutoff);
    }

    /// Evict, then compute percentiles. `None` when the window is empty.
    pub fn aggregate(&mut self, now: u64) -> Option<LatencyAggregate> {
        self.evict(now);
        if self.samples.is_empty() {
            return None;
        }

        Some(LatencyAggregate {
            p50_ms: percentile(&self.values(LatencyMetric::P50), 0.50),
            p95_ms: percentile(&self.values(LatencyMetric::P95), 0.95),
            samples: self.samples.len(),
            computed_at: now,
        })
    }

    fn newest(&self, metric: LatencyMetric) -> Option<u64> {
        self.samples
            .iter()
            .filter(|s| s.metric == metric)
            .map(|s| s.sampled_at)
            .max()
    }

    fn values(&self, metric: LatencyMetric) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|s| s.metric == metric)
            .map(|s| s.value_ms)
            .collect()
    }
}

/// Nearest-rank percentile. `None` for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let rank = (q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Visibility timeout for queue messages: `max(30s, 2 × p95)`.
///
/// The rule is defined on p95 sentence-synthesis time. Workers report only
/// time-to-first-audio, so the TTFA p95 stands in for it.
///
/// Without a p95 reading the floor applies. Readings too large for a
/// `Duration` saturate.
pub fn recommended_visibility_timeout(p95_ms: Option<f64>) -> Duration {
    let doubled = p95_ms
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| Duration::try_from_secs_f64(v * 2.0 / 1000.0).unwrap_or(Duration::MAX))
        .unwrap_or_default();
    doubled.max(MIN_VISIBILITY_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p95(value_ms: f64, at: u64) -> LatencySample {
        LatencySample {
            metric: LatencyMetric::P95,
            value_ms,
            sampled_at: at,
        }
    }

    fn p50(value_ms: f64, at: u64) -> LatencySample {
        LatencySample {
            metric: LatencyMetric::P50,
            value_ms,
            sampled_at: at,
        }
    }

    #[test]
    fn percentile_nearest_rank() {
        let values: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.95), Some(19.0));
        assert_eq!(percentile(&values, 0.50), Some(10.0));
        assert_eq!(percentile(&[7.0], 0.95), Some(7.0));
        assert_eq!(percentile(&[], 0.95), None);
    }

    #[test]
    fn empty_window_has_no_aggregate() {
        let mut window = LatencyWindow::new(Duration::from_secs(300));
        assert!(window.aggregate(1000).is_none());
    }

    #[test]
    fn aggregate_over_window() {
        let mut window = LatencyWindow::new(Duration::from_secs(300));
        window.ingest([p95(900.0, 100), p95(700.0, 160), p50(300.0, 100)]);

        let agg = window.aggregate(200).unwrap();
        assert_eq!(agg.p95_ms, Some(900.0));
        assert_eq!(agg.p50_ms, Some(300.0));
        assert_eq!(agg.samples, 3);
    }

    #[test]
    fn old_readings_are_evicted() {
        let mut window = LatencyWindow::new(Duration::from_secs(300));
        window.ingest([p95(1200.0, 100), p95(500.0, 350)]);

        // 100 is outside (410 - 300, 410].
        let agg = window.aggregate(410).unwrap();
        assert_eq!(agg.p95_ms, Some(500.0));
        assert_eq!(window.len(), 1);

        window.aggregate(700);
        assert!(window.is_empty());
    }

    #[test]
    fn duplicate_and_older_readings_rejected() {
        let mut window = LatencyWindow::new(Duration::from_secs(300));
        assert_eq!(window.ingest([p95(900.0, 100)]), 1);
        assert_eq!(window.ingest([p95(900.0, 100), p95(100.0, 90)]), 0);
        // Per-metric: an older p50 is still new for its own series.
        assert_eq!(window.ingest([p50(300.0, 90)]), 1);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut window = LatencyWindow::new(Duration::from_secs(300));
        assert_eq!(window.ingest([p95(-1.0, 10), p95(f64::NAN, 11)]), 0);
    }

    #[test]
    fn visibility_timeout_floor_and_scaling() {
        assert_eq!(recommended_visibility_timeout(None), Duration::from_secs(30));
        assert_eq!(
            recommended_visibility_timeout(Some(900.0)),
            Duration::from_secs(30)
        );
        assert_eq!(
            recommended_visibility_timeout(Some(20_000.0)),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn oversized_reading_saturates_visibility_timeout() {
        let mut window = LatencyWindow::new(Duration::from_secs(300));
        assert_eq!(window.ingest([p95(1e22, 10)]), 1);
        let p95_ms = window.aggregate(20).unwrap().p95_ms;
        assert_eq!(p95_ms, Some(1e22));
        assert_eq!(recommended_visibility_timeout(p95_ms), Duration::MAX);
        assert_eq!(
            recommended_visibility_timeout(Some(f64::MAX)),
            Duration::MAX
        );
    }
}
