//! Health check endpoints for warden-agent
//!
//! - /healthz - Liveness check
//! - /readyz - Every agent has finished at least one iteration
//! - /metrics - Aggregate workflow metrics per agent, as JSON

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use warden_workflow::MetricsHandle;

/// Shared state for health endpoints
pub struct HealthState {
    /// One handle per running agent, keyed by agent name
    pub agents: Vec<(String, MetricsHandle)>,
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let mut checks = Map::new();
    let mut ready = true;
    for (name, handle) in &state.agents {
        let iterations = handle.snapshot().await.total_iterations;
        ready &= iterations > 0;
        checks.insert(
            name.clone(),
            Value::String(if iterations > 0 { "ready" } else { "starting" }.to_string()),
        );
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "checks": checks,
    });
    (status, Json(body))
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let mut agents = Map::new();
    for (name, handle) in &state.agents {
        let snapshot = handle.snapshot().await;
        agents.insert(
            name.clone(),
            serde_json::to_value(snapshot).unwrap_or(Value::Null),
        );
    }
    Json(Value::Object(agents))
}

pub fn create_health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> (Arc<HealthState>, MetricsHandle, MetricsHandle) {
        let server = MetricsHandle::new("server");
        let client = MetricsHandle::new("client");
        let state = Arc::new(HealthState {
            agents: vec![
                ("server".to_string(), server.clone()),
                ("client".to_string(), client.clone()),
            ],
        });
        (state, server, client)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (state, _, _) = state();
        let (status, body) = get(create_health_router(state), "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_readyz_waits_for_every_agent() {
        let (state, server, client) = state();

        let (status, _) = get(create_health_router(state.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        server.record_iteration(true, Duration::from_millis(5)).await;
        let (status, body) = get(create_health_router(state.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["server"], "ready");
        assert_eq!(body["checks"]["client"], "starting");

        // A failed iteration still counts as finished.
        client.record_iteration(false, Duration::from_millis(5)).await;
        let (status, body) = get(create_health_router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_metrics_reports_each_agent() {
        let (state, server, _) = state();
        server.record_iteration(true, Duration::from_millis(5)).await;
        server.record_iteration(false, Duration::from_millis(5)).await;

        let (status, body) = get(create_health_router(state), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"]["total_iterations"], 2);
        assert_eq!(body["server"]["failed_iterations"], 1);
        assert_eq!(body["client"]["total_iterations"], 0);
    }
}
