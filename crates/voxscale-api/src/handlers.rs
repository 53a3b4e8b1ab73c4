//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::info;

use voxscale_state::{ActiveJobSignal, ManualOverride};

use crate::ApiState;
use crate::prometheus::{MetricsView, render_prometheus};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Feeds ──────────────────────────────────────────────────────

/// GET /api/v1/targets
pub async fn list_targets(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.store.list_targets(&state.fleet, query.limit()) {
        Ok(targets) => ApiResponse::ok(targets).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/targets/latest
pub async fn latest_target(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.latest_target(&state.fleet) {
        Ok(Some(target)) => ApiResponse::ok(target).into_response(),
        Ok(None) => error_response("no target yet", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/events
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.store.list_events(query.limit()) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/snapshots
pub async fn list_snapshots(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.store.list_snapshots(&state.queue, query.limit()) {
        Ok(snapshots) => ApiResponse::ok(snapshots).into_response(),
        Err(e) => internal(e),
    }
}

// ── Fleet ──────────────────────────────────────────────────────

/// GET /api/v1/fleet
pub async fn get_fleet(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.get_fleet_state(&state.fleet) {
        Ok(Some(fleet)) => ApiResponse::ok(fleet).into_response(),
        Ok(None) => error_response("fleet not initialized", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.get_status(&state.fleet) {
        Ok(Some(status)) => ApiResponse::ok(status).into_response(),
        Ok(None) => error_response("no cycle completed yet", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

/// Active-job report body.
#[derive(Debug, Deserialize)]
pub struct ActiveJobsRequest {
    pub active_render_count: u32,
}

/// POST /api/v1/workers/{id}/active-jobs
pub async fn report_active_jobs(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
    Json(req): Json<ActiveJobsRequest>,
) -> impl IntoResponse {
    let signal = ActiveJobSignal {
        worker_id,
        active_render_count: req.active_render_count,
        reported_at: epoch_secs(),
    };
    match state.store.put_active_job(&signal) {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(signal)).into_response(),
        Err(e) => internal(e),
    }
}

// ── Manual override ────────────────────────────────────────────

/// Scale request body.
#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub desired: u32,
    /// Override lifetime. Absent means until cleared.
    pub ttl_secs: Option<u64>,
}

/// POST /api/v1/scale
pub async fn set_override(
    State(state): State<ApiState>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    if req.desired < state.min || req.desired > state.max {
        return error_response(
            &format!(
                "desired {} outside [{}, {}]",
                req.desired, state.min, state.max
            ),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    if req.ttl_secs == Some(0) {
        return error_response("ttl_secs must be positive", StatusCode::BAD_REQUEST)
            .into_response();
    }

    let now = epoch_secs();
    let manual = ManualOverride {
        desired: req.desired,
        expires_at: req.ttl_secs.map(|ttl| now.saturating_add(ttl)),
        requested_at: now,
    };
    match state.store.put_override(&state.fleet, &manual) {
        Ok(()) => {
            info!(
                fleet = %state.fleet,
                desired = manual.desired,
                expires_at = ?manual.expires_at,
                "manual override set"
            );
            ApiResponse::ok(manual).into_response()
        }
        Err(e) => internal(e),
    }
}

/// DELETE /api/v1/scale
pub async fn clear_override(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.clear_override(&state.fleet) {
        Ok(true) => {
            info!(fleet = %state.fleet, "manual override cleared");
            ApiResponse::ok("cleared").into_response()
        }
        Ok(false) => error_response("no override set", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

// ── Health & Prometheus ────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let view = MetricsView {
        fleet: state.fleet.clone(),
        queue: state.queue.clone(),
        target: state.store.latest_target(&state.fleet).unwrap_or_default(),
        fleet_state: state.store.get_fleet_state(&state.fleet).unwrap_or_default(),
        snapshot: state
            .store
            .list_snapshots(&state.queue, 1)
            .unwrap_or_default()
            .into_iter()
            .next(),
        status: state.store.get_status(&state.fleet).unwrap_or_default(),
    };

    let body = render_prometheus(&view);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
