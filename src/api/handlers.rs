//! Controller API handlers.

use super::SharedState;
use crate::errors::ApiError;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use gantry_common::cr::TriggerRequest;
use gantry_common::intervention::{InterventionKind, ResumeOverrides};
use gantry_common::run::RunStatus;
use serde::Deserialize;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InterveneRequest {
    pub instructions: String,
}

#[derive(Deserialize)]
pub struct NudgeRequest {
    pub role: String,
    pub message: String,
}

#[derive(Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub overrides: Option<ResumeOverrides>,
}

// ── Handlers ──────────────────────────────────────────────────────────

/// POST /api/pipeline/trigger — create a run and spawn its worker.
/// Duplicates are rejected with 409.
pub async fn trigger(
    State(state): State<SharedState>,
    Json(request): Json<TriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".to_string()));
    }
    if request.source.trim().is_empty() {
        return Err(ApiError::BadRequest("source is required".to_string()));
    }

    let mut snapshot = state.config.snapshot();
    if let Some(model) = &request.model {
        snapshot.model = model.clone();
    }
    let raw = serde_json::to_value(&request)
        .map_err(|e| ApiError::Internal(format!("serialize request: {}", e)))?;

    let cr_id = state.store.create_run(
        request.external_id.as_deref(),
        &request.title,
        &request.source,
        &snapshot,
        &raw,
    )?;
    state.workers.spawn(&cr_id);
    Ok(Json(serde_json::json!({"cr_id": cr_id})))
}

/// GET /api/pipeline/runs — last runs, newest first.
pub async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.store.list_runs(100)?;
    Ok(Json(runs))
}

/// GET /api/pipeline/runs/{cr_id}
pub async fn get_run(
    State(state): State<SharedState>,
    Path(cr_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.store.get_run(&cr_id)?;
    Ok(Json(run))
}

/// POST /api/pipeline/{cr_id}/resume — requires `paused`. Stores the
/// overrides (1 h TTL) and spawns a worker; the worker performs the
/// paused→running CAS during startup.
pub async fn resume(
    State(state): State<SharedState>,
    Path(cr_id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.store.get_run(&cr_id)?;
    if run.status != RunStatus::Paused {
        return Err(ApiError::Conflict(format!(
            "run {} is {}, not paused",
            cr_id, run.status
        )));
    }

    if let Some(overrides) = body.overrides
        && !overrides.is_empty()
    {
        state.registry.set_overrides(&cr_id, &overrides)?;
    }
    state.workers.spawn(&cr_id);
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"cr_id": cr_id}))))
}

/// POST /api/pipeline/{cr_id}/intervene — free-text guidance consumed at
/// the next node boundary.
pub async fn intervene(
    State(state): State<SharedState>,
    Path(cr_id): Path<String>,
    Json(body): Json<InterveneRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.instructions.trim().is_empty() {
        return Err(ApiError::BadRequest("instructions are required".to_string()));
    }
    state.store.get_run(&cr_id)?;
    state
        .registry
        .set(&cr_id, InterventionKind::Instructions, "", &body.instructions, None)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/pipeline/{cr_id}/nudge — guidance keyed to one agent role.
pub async fn nudge(
    State(state): State<SharedState>,
    Path(cr_id): Path<String>,
    Json(body): Json<NudgeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.role.trim().is_empty() {
        return Err(ApiError::BadRequest("role is required".to_string()));
    }
    state.store.get_run(&cr_id)?;
    state
        .registry
        .set(&cr_id, InterventionKind::Nudge, &body.role, &body.message, None)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/pipeline/{cr_id}/cancel — only a paused run can be
/// cancelled; a running one must pause first.
pub async fn cancel(
    State(state): State<SharedState>,
    Path(cr_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_run(&cr_id)?;
    if !state
        .store
        .update_status(&cr_id, RunStatus::Paused, RunStatus::Cancelled)?
    {
        return Err(ApiError::Conflict(format!(
            "run {} is not paused; pause it before cancelling",
            cr_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/pipeline/{cr_id}/conversation/{key}
pub async fn get_conversation(
    State(state): State<SharedState>,
    Path((cr_id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_run(&cr_id)?;
    let messages = state
        .store
        .get_conversation(&cr_id, &key)?
        .ok_or_else(|| ApiError::NotFound(format!("no conversation {}", key)))?;
    Ok(Json(messages))
}

/// GET /api/pipeline/{cr_id}/logs — the worker's per-run log.
pub async fn get_logs(
    State(state): State<SharedState>,
    Path(cr_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_run(&cr_id)?;
    let path = state.runs_dir.join(&cr_id).join("run.log");
    let text = std::fs::read_to_string(path).unwrap_or_default();
    Ok(text)
}

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

/// Readiness checks State Store and Event Bus connectivity.
pub async fn readyz(State(state): State<SharedState>) -> impl IntoResponse {
    if state.store.list_runs(1).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "state store unavailable");
    }
    if state.bus.ping().is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "event bus unavailable");
    }
    (StatusCode::OK, "ready")
}

#[cfg(test)]
mod tests {
    use crate::api::{AppState, SharedState, api_router};
    use crate::agent::ratelimit::TokenBucket;
    use crate::agent::scripted::ScriptedBackend;
    use crate::agent::AgentRunner;
    use crate::bus::EventBus;
    use crate::config::Config;
    use crate::executor::Executor;
    use crate::intervene::InterventionRegistry;
    use crate::store::{Database, RunStore};
    use crate::worker::WorkerRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gantry_common::intervention::InterventionKind;
    use gantry_common::run::RunStatus;
    use gantry_common::snapshot::{ConfigSnapshot, RetryPolicy};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn app() -> (axum::Router, SharedState) {
        let db = Database::in_memory().unwrap();
        let store = RunStore::new(db.clone());
        let bus = EventBus::new(db.clone(), "default");
        let registry = InterventionRegistry::new(db, bus.clone());
        let runner = AgentRunner::new(
            Arc::new(ScriptedBackend::new()),
            Arc::new(TokenBucket::per_minute(6000)),
            RetryPolicy { max_attempts: 2, base_delay_secs: 0 },
        );
        let scratch = std::env::temp_dir().join(format!("gantry-api-{}", uuid::Uuid::new_v4()));
        let executor = Executor::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
            runner,
            scratch.join("runs"),
            scratch.join("clones"),
        );
        let state = Arc::new(AppState {
            store,
            bus,
            registry,
            workers: WorkerRegistry::new(executor),
            config: Config::default(),
            runs_dir: scratch.join("runs"),
        });
        (api_router().with_state(Arc::clone(&state)), state)
    }

    async fn post_json(
        app: &axum::Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn trigger_creates_a_run_and_returns_cr_id() {
        let (app, state) = app();
        let (status, body) = post_json(
            &app,
            "/api/pipeline/trigger",
            serde_json::json!({"title": "Add /health", "source": "api"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cr_id = body["cr_id"].as_str().unwrap().to_string();
        let run = state.store.get_run(&cr_id).unwrap();
        assert_eq!(run.title, "Add /health");
    }

    #[tokio::test]
    async fn trigger_validates_required_fields() {
        let (app, _state) = app();
        let (status, _) =
            post_json(&app, "/api/pipeline/trigger", serde_json::json!({"source": "api"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_trigger_returns_conflict() {
        let (app, _state) = app();
        let payload = serde_json::json!({
            "title": "x", "source": "jira", "external_id": "JIRA-123"
        });
        let (first, _) = post_json(&app, "/api/pipeline/trigger", payload.clone()).await;
        assert_eq!(first, StatusCode::OK);
        let (second, body) = post_json(&app, "/api/pipeline/trigger", payload).await;
        assert_eq!(second, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("JIRA-123"));
    }

    #[tokio::test]
    async fn resume_requires_paused_status() {
        let (app, state) = app();
        let cr_id = state
            .store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        let (status, _) = post_json(
            &app,
            &format!("/api/pipeline/{}/resume", cr_id),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn resume_stores_overrides_for_the_worker() {
        let (app, state) = app();
        let cr_id = state
            .store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        state.store.update_status(&cr_id, RunStatus::Pending, RunStatus::Running).unwrap();
        state.store.update_status(&cr_id, RunStatus::Running, RunStatus::Paused).unwrap();

        let (status, _) = post_json(
            &app,
            &format!("/api/pipeline/{}/resume", cr_id),
            serde_json::json!({"overrides": {"review_passed": true}}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        // The worker may have consumed them already; accept either, but
        // the intervention must have been recorded on the stream.
        let events = state.bus.read_since(&cr_id, 0).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind.event_type() == "intervention_set"));
    }

    #[tokio::test]
    async fn intervene_writes_the_registry() {
        let (app, state) = app();
        let cr_id = state
            .store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        let (status, _) = post_json(
            &app,
            &format!("/api/pipeline/{}/intervene", cr_id),
            serde_json::json!({"instructions": "smaller steps"}),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(
            state
                .registry
                .peek(&cr_id, InterventionKind::Instructions, "")
                .unwrap()
                .as_deref(),
            Some("smaller steps")
        );
    }

    #[tokio::test]
    async fn nudge_is_keyed_by_role() {
        let (app, state) = app();
        let cr_id = state
            .store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        let (status, _) = post_json(
            &app,
            &format!("/api/pipeline/{}/nudge", cr_id),
            serde_json::json!({"role": "code_writer", "message": "simplify"}),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state
            .registry
            .peek(&cr_id, InterventionKind::Nudge, "code_writer")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cancel_only_from_paused() {
        let (app, state) = app();
        let cr_id = state
            .store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        let (status, _) = post_json(
            &app,
            &format!("/api/pipeline/{}/cancel", cr_id),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        state.store.update_status(&cr_id, RunStatus::Pending, RunStatus::Running).unwrap();
        state.store.update_status(&cr_id, RunStatus::Running, RunStatus::Paused).unwrap();
        let (status, _) = post_json(
            &app,
            &format!("/api/pipeline/{}/cancel", cr_id),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.get_run(&cr_id).unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let (app, _state) = app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/pipeline/runs/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn readyz_reports_ready_with_live_backends() {
        let (app, _state) = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
