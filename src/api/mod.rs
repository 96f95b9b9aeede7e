//! Controller API: external entry points for triggering, listing,
//! resuming, intervening, and streaming.

pub mod handlers;
pub mod server;
pub mod sse;

use crate::bus::EventBus;
use crate::config::Config;
use crate::errors::ApiError;
use crate::intervene::InterventionRegistry;
use crate::store::RunStore;
use crate::worker::WorkerRegistry;
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::path::PathBuf;
use std::sync::Arc;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: RunStore,
    pub bus: EventBus,
    pub registry: InterventionRegistry,
    pub workers: WorkerRegistry,
    pub config: Config,
    pub runs_dir: PathBuf,
}

pub type SharedState = Arc<AppState>;

// ── Error mapping ─────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/pipeline/trigger", post(handlers::trigger))
        .route("/api/pipeline/runs", get(handlers::list_runs))
        .route("/api/pipeline/runs/{cr_id}", get(handlers::get_run))
        .route("/api/pipeline/{cr_id}/resume", post(handlers::resume))
        .route("/api/pipeline/{cr_id}/intervene", post(handlers::intervene))
        .route("/api/pipeline/{cr_id}/nudge", post(handlers::nudge))
        .route("/api/pipeline/{cr_id}/cancel", post(handlers::cancel))
        .route(
            "/api/pipeline/{cr_id}/conversation/{key}",
            get(handlers::get_conversation),
        )
        .route("/api/pipeline/{cr_id}/logs", get(handlers::get_logs))
        .route("/api/events/stream", get(sse::stream))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
}
