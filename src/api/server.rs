//! Server assembly and startup.

use super::{AppState, api_router};
use crate::agent::claude::ClaudeBackend;
use crate::agent::ratelimit::TokenBucket;
use crate::agent::AgentRunner;
use crate::bus::EventBus;
use crate::config::Config;
use crate::executor::Executor;
use crate::intervene::InterventionRegistry;
use crate::store::{Database, RunStore};
use crate::worker::WorkerRegistry;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

/// How often the retention sweep runs.
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

pub fn build_state(config: Config) -> Result<Arc<AppState>> {
    let server = config.server();
    let db = Database::open(&server.db_path)?;
    let store = RunStore::new(db.clone());
    let bus = EventBus::new(db.clone(), &server.tenant);
    let registry = InterventionRegistry::new(db, bus.clone());

    let backend = ClaudeBackend::new(&config.agent_command());
    let runner = AgentRunner::new(
        Arc::new(backend),
        Arc::new(TokenBucket::per_minute(config.agent.calls_per_minute)),
        config.snapshot().retry,
    );
    let executor = Executor::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        runner,
        server.runs_dir.clone(),
        server.clones_dir.clone(),
    );
    let workers = WorkerRegistry::new(executor);

    Ok(Arc::new(AppState {
        store,
        bus,
        registry,
        workers,
        config,
        runs_dir: server.runs_dir,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api_router().layer(CorsLayer::permissive()).with_state(state)
}

/// Start the controller: recover orphaned runs, launch the retention
/// sweep, and serve the API.
pub async fn start_server(config: Config) -> Result<()> {
    let port = config.server().port;
    let state = build_state(config)?;

    match state.workers.recover_orphans(&state.store) {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "recovered orphaned runs"),
        Err(e) => tracing::error!(error = %e, "orphan recovery failed"),
    }

    // Periodic retention sweep for terminal runs' event streams.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let retention = state.config.snapshot().event_retention_days;
                match state.bus.purge_expired(retention) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(rows = n, "purged expired event streams"),
                    Err(e) => tracing::warn!(error = %e, "event purge failed"),
                }
            }
        });
    }

    let router = build_router(Arc::clone(&state));
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "gantry controller listening");
    axum::serve(listener, router)
        .await
        .context("Server terminated")?;
    Ok(())
}
