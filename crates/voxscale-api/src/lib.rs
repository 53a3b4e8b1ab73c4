//! voxscale-api: operator REST API.
//!
//! Serves what the control loop publishes and accepts the inputs that
//! come from outside the loop (active-job reports, manual overrides).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/targets?limit=` | ScalingTarget feed, newest first |
//! | GET | `/api/v1/targets/latest` | Latest ScalingTarget |
//! | GET | `/api/v1/events?limit=` | Health events, newest first |
//! | GET | `/api/v1/snapshots?limit=` | Recent queue snapshots |
//! | GET | `/api/v1/fleet` | Latest FleetState |
//! | GET | `/api/v1/status` | Capacity health and loop status |
//! | POST | `/api/v1/workers/{id}/active-jobs` | Active-job report |
//! | POST | `/api/v1/scale` | Manual override `{desired, ttl_secs?}` |
//! | DELETE | `/api/v1/scale` | Clear the manual override |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use axum::Router;
use axum::routing::{get, post};
use voxscale_state::StateStore;

pub use prometheus::{MetricsView, render_prometheus};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub fleet: String,
    pub queue: String,
    /// Bounds a manual override must respect.
    pub min: u32,
    pub max: u32,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/targets", get(handlers::list_targets))
        .route("/targets/latest", get(handlers::latest_target))
        .route("/events", get(handlers::list_events))
        .route("/snapshots", get(handlers::list_snapshots))
        .route("/fleet", get(handlers::get_fleet))
        .route("/status", get(handlers::get_status))
        .route("/workers/{id}/active-jobs", post(handlers::report_active_jobs))
        .route(
            "/scale",
            post(handlers::set_override).delete(handlers::clear_override),
        )
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use voxscale_state::{HealthEvent, HealthEventKind};

    fn router() -> (Router, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let state = ApiState {
            store: store.clone(),
            fleet: "gpu-workers".to_string(),
            queue: "story-tasks".to_string(),
            min: 0,
            max: 4,
        };
        (build_router(state), store)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_ok() {
        let (router, _) = router();
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn events_feed_is_newest_first() {
        let (router, store) = router();
        store
            .append_event(&HealthEvent::new(1, HealthEventKind::SourceRecovered))
            .unwrap();
        store
            .append_event(&HealthEvent::new(2, HealthEventKind::FallbackActivated))
            .unwrap();

        let req = Request::builder()
            .uri("/api/v1/events?limit=1")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["type"], "fallback_activated");
    }

    #[tokio::test]
    async fn scale_then_clear() {
        let (router, store) = router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/scale")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"desired":2,"ttl_secs":300}"#))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.get_override("gpu-workers").unwrap().unwrap().desired, 2);

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/v1/scale")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(store.get_override("gpu-workers").unwrap().is_none());
    }

    #[tokio::test]
    async fn active_jobs_route() {
        let (router, store) = router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/workers/i-0003/active-jobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"active_render_count":1}"#))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(store.list_active_jobs().unwrap()[0].worker_id, "i-0003");
    }

    #[tokio::test]
    async fn fleet_missing_is_not_found() {
        let (router, _) = router();
        let req = Request::builder()
            .uri("/api/v1/fleet")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_exposition() {
        let (router, _) = router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE voxscale_desired_capacity gauge"));
    }
}
