//! Typed error hierarchy for the Gantry core.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — state store, event bus, and intervention registry failures
//! - `PipelineError` — graph executor and stage node failures
//! - `ApiError` — controller API failures (mapped to HTTP in `api`)

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A run with the same `(source, external_id)` exists in a
    /// non-terminal status.
    #[error("Duplicate change request: {source_system}/{external_id}")]
    Duplicate { source_system: String, external_id: String },

    #[error("Run {cr_id} not found")]
    NotFound { cr_id: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from graph execution and stage bodies.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run could not be claimed: another worker holds it or the status
    /// is terminal. Not logged as an error.
    #[error("Run {cr_id} could not be claimed (status {status})")]
    ClaimLost { cr_id: String, status: String },

    #[error("Stage {stage} exceeded its {timeout_secs}s timeout")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("No repositories specified for the change request")]
    NoRepos,

    #[error("Git operation failed for {repo}: {message}")]
    Git { repo: String, message: String },

    #[error("Agent failure in stage {stage}: {source}")]
    Agent {
        stage: String,
        #[source]
        source: gantry_common::AgentError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the controller API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// Duplicate trigger or resume of a non-paused run. Maps to 409.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { .. } => ApiError::Conflict(err.to_string()),
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
