//! # Status API
//!
//! Builds the axum router that exposes the node's HTTP interface. Handlers
//! share a [`Node`] handle through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path            | Description                                |
//! |--------|-----------------|--------------------------------------------|
//! | GET    | `/health`       | Liveness probe                             |
//! | GET    | `/status`       | Epoch, latest tick, peers, traffic         |
//! | GET    | `/ticks/latest` | Latest finalized tick with its signatures  |

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ticknet_protocol::network::NodeStatus;
use ticknet_protocol::Node;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Reported in `/status`.
    pub version: String,
    pub node: Node,
}

/// Body of `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    /// Known tick number, finalized or configured. Absent until one exists.
    pub tick: Option<u32>,
    #[serde(flatten)]
    pub node: NodeStatus,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ticks/latest", get(latest_tick_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — 200 while the process is serving.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    Json(StatusResponse {
        version: state.version.clone(),
        tick: node.has_tick().then(|| node.latest_tick_number()),
        node: node.status(),
    })
}

/// `GET /ticks/latest` — 404 until a quorum has finalized a tick.
async fn latest_tick_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.node.latest_tick() {
        Some(tick) => (StatusCode::OK, Json(serde_json::json!(tick))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no finalized tick yet" })),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
