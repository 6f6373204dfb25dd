//! HTTP API handler

use super::server::AgentServices;
use super::websocket::handle_socket;
use crate::protocol::{Capability, HealthReport};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// State shared by every route
#[derive(Clone)]
pub(crate) struct ApiState {
    pub services: AgentServices,
    /// Server-wide shutdown; each connection's root token is a child of it
    pub shutdown: CancellationToken,
}

/// Build the agent router
pub(crate) fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/metrics", get(get_metrics))
        .route("/api/system", get(get_system))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    let hostname = sysinfo::System::host_name().unwrap_or_default();
    Json(HealthReport {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname,
        capabilities: vec![Capability::Metrics, Capability::Logs, Capability::Commands],
    })
}

/// One-shot metrics snapshot
async fn get_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.services.metrics.sample().await {
        Ok(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// Static host information
async fn get_system(State(state): State<ApiState>) -> impl IntoResponse {
    match state.services.metrics.system_info().await {
        Ok(info) => (StatusCode::OK, Json(serde_json::json!(info))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// Upgrade to the control channel
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let root = state.shutdown.child_token();
    ws.on_upgrade(move |socket| handle_socket(socket, state.services, root, peer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, FakeInspector, FakeLogs, FakeMetrics};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn make_app(metrics: FakeMetrics) -> Router {
        router(ApiState {
            services: AgentServices {
                metrics: Arc::new(metrics),
                logs: Arc::new(FakeLogs::default()),
                inspector: Arc::new(FakeInspector),
                executor: Arc::new(FakeExecutor::default()),
                agent: Default::default(),
                timeouts: Default::default(),
            },
            shutdown: CancellationToken::new(),
        })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 64)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_health_advertises_capabilities() {
        let (status, json) = get(make_app(FakeMetrics::default()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(
            json["capabilities"],
            serde_json::json!(["metrics", "logs", "commands"])
        );
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let (status, json) = get(make_app(FakeMetrics::default()), "/api/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["timestamp"], 1);
        assert!(json["memory"].get("usagePercent").is_some());
    }

    #[tokio::test]
    async fn test_metrics_failure_is_500() {
        let (status, json) = get(make_app(FakeMetrics::failing_on(&[1])), "/api/metrics").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("probe 1 failed"));
    }

    #[tokio::test]
    async fn test_system_info() {
        let (status, json) = get(make_app(FakeMetrics::default()), "/api/system").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["hostname"], "fake-host");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get(make_app(FakeMetrics::default()), "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
