//! The per-CR event stream vocabulary.
//!
//! Events are appended by the executor and stage bodies, persisted by the
//! event bus, and re-emitted over SSE. The enum is closed: unknown
//! `event_type` tags decode to [`EventKind::Unknown`], which boundaries log
//! and drop rather than silently accept.

use crate::finding::Finding;
use crate::run::PauseReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One event on a CR's ordered stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub cr_id: String,
    /// Assigned by the bus, strictly monotonic per CR.
    pub sequence_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Stage (or composite sub-stage label, e.g. `tdd:test_writer`) the
    /// event belongs to.
    pub stage: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Closed sum of event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    PipelineStarted {
        title: String,
    },
    StageEntered {
        /// Loop context carried into a re-entered stage (verification
        /// feedback, review findings summary).
        context: Option<String>,
    },
    StageCompleted {},
    AgentStarted {
        role: String,
        repo: Option<String>,
    },
    AgentCompleted {
        role: String,
        repo: Option<String>,
        model: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    AgentToolCall {
        role: String,
        tool: String,
        summary: String,
    },
    AgentOutput {
        role: String,
        text: String,
    },
    AgentNudge {
        role: String,
        message: String,
    },
    PhaseStarted {
        phase: String,
    },
    PhaseCompleted {
        phase: String,
    },
    TestRun {
        repo: String,
        passed: bool,
        summary: String,
    },
    ReviewFinding {
        finding: Finding,
    },
    CostUpdate {
        delta_usd: f64,
        cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
    },
    InterventionSet {
        kind: String,
    },
    PipelinePaused {
        reason: PauseReason,
        detail: Option<String>,
    },
    PipelineResumed {},
    PipelineCompleted {
        cost_usd: f64,
    },
    PipelineFailed {
        error: String,
    },
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline_started",
            Self::StageEntered { .. } => "stage_entered",
            Self::StageCompleted {} => "stage_completed",
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::AgentToolCall { .. } => "agent_tool_call",
            Self::AgentOutput { .. } => "agent_output",
            Self::AgentNudge { .. } => "agent_nudge",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::TestRun { .. } => "test_run",
            Self::ReviewFinding { .. } => "review_finding",
            Self::CostUpdate { .. } => "cost_update",
            Self::InterventionSet { .. } => "intervention_set",
            Self::PipelinePaused { .. } => "pipeline_paused",
            Self::PipelineResumed {} => "pipeline_resumed",
            Self::PipelineCompleted { .. } => "pipeline_completed",
            Self::PipelineFailed { .. } => "pipeline_failed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a live stream for the CR closes on this event.
    ///
    /// `pipeline_paused` is not terminal for the CR, but it terminates the
    /// stream until a resume starts a fresh one.
    pub fn closes_stream(&self) -> bool {
        matches!(
            self,
            Self::PipelineCompleted { .. } | Self::PipelineFailed { .. } | Self::PipelinePaused { .. }
        )
    }
}

/// Stream key naming scheme: `{tenant}:cr:{cr_id}:events`.
pub fn stream_key(tenant: &str, cr_id: &str) -> String {
    format!("{}:cr:{}:events", tenant, cr_id)
}
