//! Prometheus text exposition format.

use std::fmt::Write;

use voxscale_state::{CapacityHealth, ControlStatus, FleetState, QueueSnapshot, ScalingTarget};

/// The latest published values for one fleet and its queue.
#[derive(Debug, Clone, Default)]
pub struct MetricsView {
    pub fleet: String,
    pub queue: String,
    pub target: Option<ScalingTarget>,
    pub fleet_state: Option<FleetState>,
    pub snapshot: Option<QueueSnapshot>,
    pub status: Option<ControlStatus>,
}

fn header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

/// Render the view as GAUGE metrics with `fleet` / `queue` labels.
/// Values not yet published are omitted; headers are always present.
pub fn render_prometheus(view: &MetricsView) -> String {
    let mut out = String::new();
    let fleet = &view.fleet;
    let queue = &view.queue;

    header(&mut out, "voxscale_desired_capacity", "Latest desired capacity.");
    if let Some(t) = &view.target {
        let _ = writeln!(
            out,
            "voxscale_desired_capacity{{fleet=\"{fleet}\",reason=\"{}\"}} {}",
            t.reason, t.desired_capacity
        );
    }

    header(&mut out, "voxscale_current_capacity", "Capacity requested from the provider.");
    header(&mut out, "voxscale_in_service", "Instances in service.");
    header(&mut out, "voxscale_pending", "Instances launching.");
    if let Some(s) = &view.fleet_state {
        let _ = writeln!(out, "voxscale_current_capacity{{fleet=\"{fleet}\"}} {}", s.current_capacity);
        let _ = writeln!(out, "voxscale_in_service{{fleet=\"{fleet}\"}} {}", s.in_service);
        let _ = writeln!(out, "voxscale_pending{{fleet=\"{fleet}\"}} {}", s.pending);
    }

    header(&mut out, "voxscale_queue_depth", "Visible messages in the queue.");
    header(
        &mut out,
        "voxscale_oldest_message_age_seconds",
        "Age of the oldest queued message.",
    );
    if let Some(s) = &view.snapshot {
        let _ = writeln!(out, "voxscale_queue_depth{{queue=\"{queue}\"}} {}", s.depth);
        let _ = writeln!(
            out,
            "voxscale_oldest_message_age_seconds{{queue=\"{queue}\"}} {:.2}",
            s.oldest_age_seconds
        );
    }

    header(&mut out, "voxscale_ttfa_p95_ms", "P95 time-to-first-audio over the latency window.");
    header(&mut out, "voxscale_consecutive_stale", "Consecutive failed queue samples.");
    header(&mut out, "voxscale_active_renders", "Active renders reported by workers.");
    header(
        &mut out,
        "voxscale_recommended_visibility_timeout_seconds",
        "Suggested queue visibility timeout.",
    );
    header(&mut out, "voxscale_gpu_available", "1 while a healthy GPU worker is in service.");
    header(&mut out, "voxscale_capacity_health", "1 for the current capacity health state.");
    if let Some(s) = &view.status {
        if let Some(p95) = s.latency_p95_ms {
            let _ = writeln!(out, "voxscale_ttfa_p95_ms{{fleet=\"{fleet}\"}} {p95:.2}");
        }
        let _ = writeln!(out, "voxscale_consecutive_stale{{fleet=\"{fleet}\"}} {}", s.consecutive_stale);
        let _ = writeln!(out, "voxscale_active_renders{{fleet=\"{fleet}\"}} {}", s.active_renders);
        let _ = writeln!(
            out,
            "voxscale_recommended_visibility_timeout_seconds{{fleet=\"{fleet}\"}} {}",
            s.recommended_visibility_timeout_secs
        );
        let _ = writeln!(
            out,
            "voxscale_gpu_available{{fleet=\"{fleet}\"}} {}",
            u8::from(s.gpu_available)
        );
        for (state, label) in [
            (CapacityHealth::Healthy, "healthy"),
            (CapacityHealth::Shortfall, "shortfall"),
            (CapacityHealth::Fallback, "fallback"),
        ] {
            let value = u8::from(s.capacity_health == state);
            let _ = writeln!(
                out,
                "voxscale_capacity_health{{fleet=\"{fleet}\",state=\"{label}\"}} {value}"
            );
        }
    }

    out
}
