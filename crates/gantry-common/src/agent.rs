//! The agent backend interface.
//!
//! Every backend implements two operations: `execute` (drive the task to
//! completion, return output and token usage) and `stream` (same, while
//! forwarding live [`AgentEvent`]s to a channel). Backends are external
//! collaborators; the pipeline core only sequences them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from a single agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Rate-limit-class failure (HTTP 429 / provider overload). Retried
    /// with exponential backoff.
    #[error("Agent rate limited: {0}")]
    RateLimited(String),

    /// No response within the per-call timeout.
    #[error("Agent call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Backend produced output the caller could not parse.
    #[error("Failed to parse agent output: {0}")]
    Parse(String),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Agent exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether the retry policy applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// One unit of work handed to a backend.
#[derive(Debug, Clone)]
pub struct AgentTask {
    /// Role name (spec_writer, verifier, test_writer, code_writer,
    /// security_reviewer, ...). Keys nudges and conversation storage.
    pub role: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    /// Explore-phase model for three-phase execution; empty skips the phase.
    pub explore_model: String,
    /// Plan-phase model for three-phase execution; empty skips the phase.
    pub plan_model: String,
    pub allowed_tools: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Key the conversation is stored under for later retrieval.
    pub conversation_key: String,
}

impl AgentTask {
    pub fn new(role: &str, model: &str, working_dir: PathBuf) -> Self {
        Self {
            role: role.to_string(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            model: model.to_string(),
            explore_model: String::new(),
            plan_model: String::new(),
            allowed_tools: Vec::new(),
            working_dir,
            timeout: Duration::from_secs(120),
            conversation_key: String::new(),
        }
    }

    /// Whether three-phase execution is requested at all.
    pub fn has_phases(&self) -> bool {
        !self.explore_model.is_empty() || !self.plan_model.is_empty()
    }
}

/// Completed invocation: output plus accounting and the stored
/// conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub output: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model_id: String,
    pub conversation: Value,
}

impl AgentOutcome {
    pub fn empty(model_id: &str) -> Self {
        Self {
            output: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            model_id: model_id.to_string(),
            conversation: Value::Null,
        }
    }
}

/// Live events forwarded during an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarted { role: String },
    ToolCall { tool: String, input: Value },
    ToolResult { tool: String, result: Value },
    Output { text: String },
    PhaseStarted { phase: String },
    PhaseCompleted { phase: String },
    AgentCompleted {
        input_tokens: u64,
        output_tokens: u64,
        model_id: String,
    },
}

/// An LLM agent backend.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Drive the task to completion while forwarding live events. Send
    /// failures on the channel must be ignored — a dropped receiver does
    /// not abort the task.
    async fn stream(
        &self,
        task: AgentTask,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutcome, AgentError>;

    /// Drive the task to completion, discarding live events.
    async fn execute(&self, task: AgentTask) -> Result<AgentOutcome, AgentError> {
        let (tx, mut rx) = mpsc::channel(64);
        let fut = self.stream(task, tx);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                outcome = &mut fut => return outcome,
                event = rx.recv() => {
                    if event.is_none() {
                        // Sender side finished first; fall through to the
                        // outcome.
                        return fut.await;
                    }
                }
            }
        }
    }
}
