//! HTTP API Server
//!
//! REST surface for the initialization manager: progress queries plus the
//! start, cancel and reinitialize controls.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::lifecycle::InitManager;
use crate::model::{NodeRecord, SnapshotSession};
use crate::progress::InitProgress;
use crate::state::TransitionRecord;

/// Shared application state
pub struct AppState {
    /// Node this daemon runs on
    pub node_id: String,
    pub manager: Arc<InitManager>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node_id: String, manager: Arc<InitManager>) -> Self {
        let state = Arc::new(AppState {
            node_id,
            manager,
            started: Instant::now(),
        });
        Self { config, state }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/nodes", get(handle_nodes))
            .route("/nodes/:node_id", get(handle_node))
            .route("/nodes/:node_id/progress", get(handle_progress))
            .route("/nodes/:node_id/transitions", get(handle_transitions))
            // Control operations
            .route("/nodes/:node_id/init", post(handle_start))
            .route("/nodes/:node_id/cancel", post(handle_cancel))
            .route("/nodes/:node_id/reinit", post(handle_reinit))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Start request
#[derive(Debug, Deserialize, Serialize)]
pub struct StartRequest {
    pub source: String,
}

/// Control response
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub node_id: String,
    pub message: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub nodes: usize,
    pub uptime_seconds: u64,
}

/// Full node view
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub record: NodeRecord,
    pub progress: InitProgress,
    pub session: Option<SnapshotSession>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::NodeNotFound(_) => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
            Error::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            Error::InvalidRequest(_) | Error::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

fn accepted(node_id: String, message: &str) -> Json<ControlResponse> {
    Json(ControlResponse {
        success: true,
        node_id,
        message: message.to_string(),
    })
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        nodes: state.manager.list().await.len(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list().await)
}

async fn handle_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<NodeResponse>, Error> {
    let status = state.manager.status(&node_id).await?;
    Ok(Json(NodeResponse {
        record: status.record.clone(),
        progress: status.progress.clone(),
        session: status.session.clone(),
    }))
}

async fn handle_progress(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<InitProgress>, Error> {
    Ok(Json(state.manager.progress(&node_id).await?))
}

async fn handle_transitions(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<Vec<TransitionRecord>>, Error> {
    Ok(Json(state.manager.transitions(&node_id).await?))
}

async fn handle_start(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(req): Json<StartRequest>,
) -> std::result::Result<Json<ControlResponse>, Error> {
    state.manager.start_init(&node_id, &req.source).await?;
    Ok(accepted(node_id, "Initialization started"))
}

async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<ControlResponse>, Error> {
    state.manager.cancel_init(&node_id).await?;
    Ok(accepted(node_id, "Cancellation requested"))
}

async fn handle_reinit(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> std::result::Result<Json<ControlResponse>, Error> {
    state.manager.reinitialize_node(&node_id).await?;
    Ok(accepted(node_id, "Reinitialization started"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CatchupConfig, InitializationConfig};
    use crate::executor::MemoryCluster;
    use crate::model::InitState;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<InitManager>) {
        let cluster = Arc::new(MemoryCluster::new());
        let primary = cluster.add_node("primary").await;
        cluster.add_node("replica").await;
        primary.create_table("public", "accounts", &[]).await;
        primary.insert_rows("public.accounts", ["1\talice", "2\tbob"]).await.unwrap();

        let init = InitializationConfig {
            sample_interval_ms: 10,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let catchup = CatchupConfig {
            poll_interval_ms: 5,
            ..Default::default()
        };
        let manager = Arc::new(InitManager::new(cluster, init, catchup));
        manager.register_node("replica", "Replica").await.unwrap();

        let state = Arc::new(AppState {
            node_id: "primary".into(),
            manager: Arc::clone(&manager),
            started: Instant::now(),
        });
        (HttpServer::create_router(state, false), manager)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(b) => {
                req = req.header("content-type", "application/json");
                Body::from(b.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_listing() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["nodes"], 1);

        let (status, body) = send(&app, "GET", "/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["node_id"], "replica");
        assert_eq!(body[0]["state"], "uninitialized");
    }

    #[tokio::test]
    async fn test_unknown_node_is_404() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/nodes/ghost/progress", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NODE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_init_over_http() {
        let (app, manager) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/nodes/replica/init",
            Some(r#"{"source":"primary"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let handle = manager.handle("replica").await.unwrap();
        handle
            .wait_until(Duration::from_secs(10), |s| s.record.state == InitState::Synchronized)
            .await
            .unwrap();

        let (status, body) = send(&app, "GET", "/nodes/replica/progress", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "synchronized");
        assert_eq!(body["tables_completed"], 1);
        assert_eq!(body["overall_percent"], 100.0);

        // start is not accepted from synchronized
        let (status, body) = send(
            &app,
            "POST",
            "/nodes/replica/init",
            Some(r#"{"source":"primary"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (app, _) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/nodes/replica/init",
            Some(r#"{"source":"replica"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let (status, _) = send(&app, "POST", "/nodes/replica/reinit", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_uninitialized_node() {
        let (app, _) = app().await;
        let (status, _) = send(&app, "POST", "/nodes/replica/cancel", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, "GET", "/nodes/replica", None).await;
        assert_eq!(body["record"]["state"], "failed");
        assert_eq!(body["progress"]["error_message"], "cancelled by operator");
    }
}
