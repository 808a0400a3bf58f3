//! HTTP Router
//!
//! `/` liveness, `/api/get_status` registry dump, `/ws` change feed.

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handler::handle_websocket;
use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/api/get_status", get(get_status))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    /// Glob over component ids, e.g. `node*`
    filter: Option<String>,
}

/// WebSocket upgrade handler
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.filter))
}

async fn liveness() -> Json<bool> {
    Json(true)
}

/// Fresh read of the registry
async fn get_status(State(state): State<AppState>) -> Response {
    let registry = state.registry().clone();
    match tokio::task::spawn_blocking(move || registry.get_all()).await {
        Ok(Ok(snapshot)) => Json(snapshot).into_response(),
        Ok(Err(e)) => {
            tracing::warn!("Failed to read registry: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HeartbeatConfig;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use sdk_core::{ComponentRecord, ComponentState, Registry, Snapshot};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(temp: &TempDir) -> (Router, Registry) {
        let registry = Registry::new(temp.path().join("component_state.json"));
        let state = AppState::new(registry.clone(), Snapshot::new(), HeartbeatConfig::default());
        (create_router(state), registry)
    }

    #[tokio::test]
    async fn test_liveness_returns_true() {
        let temp = TempDir::new().unwrap();
        let (app, _) = app(&temp);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"true");
    }

    #[tokio::test]
    async fn test_get_status_returns_registry() {
        let temp = TempDir::new().unwrap();
        let (app, registry) = app(&temp);
        registry
            .upsert(
                ComponentRecord::new("node1", "node")
                    .with_pid(10)
                    .with_state(ComponentState::Running),
            )
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/get_status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["node1"]["component_state"], "Running");
        assert_eq!(json["node1"]["pid"], 10);
    }
}
