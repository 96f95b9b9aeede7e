//! Agent invocation plumbing.
//!
//! [`AgentRunner`] wraps a backend with the shared token bucket, the
//! per-call timeout, rate-limit retries, and optional three-phase
//! execution (explore → plan → act). Stages never call a backend
//! directly.

pub mod claude;
pub mod ratelimit;
pub mod retry;
pub mod scripted;
pub mod tools;

use gantry_common::agent::{AgentBackend, AgentError, AgentEvent, AgentOutcome, AgentTask};
use gantry_common::snapshot::RetryPolicy;
use ratelimit::TokenBucket;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Tools available during the read-only explore phase.
pub const READ_ONLY_TOOLS: &[&str] = &["read_file", "list_directory"];

/// The full tool allowlist for acting agents.
pub const ALL_TOOLS: &[&str] = &["read_file", "write_file", "list_directory", "run_command"];

pub fn tool_list(tools: &[&str]) -> Vec<String> {
    tools.iter().map(|t| t.to_string()).collect()
}

/// One model invocation's accounting, priced separately per phase.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Aggregate result of a (possibly multi-phase) agent run.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub output: String,
    pub conversation: Value,
    pub calls: Vec<ModelCall>,
}

impl AgentRunResult {
    fn from_single(outcome: AgentOutcome) -> Self {
        Self {
            output: outcome.output,
            conversation: outcome.conversation,
            calls: vec![ModelCall {
                model_id: outcome.model_id,
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
            }],
        }
    }
}

#[derive(Clone)]
pub struct AgentRunner {
    backend: Arc<dyn AgentBackend>,
    bucket: Arc<TokenBucket>,
    retry: RetryPolicy,
}

impl AgentRunner {
    pub fn new(backend: Arc<dyn AgentBackend>, bucket: Arc<TokenBucket>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            bucket,
            retry,
        }
    }

    /// Run a task to completion. With phase models set, decomposes into
    /// explore → plan → act; with both empty the behaviour is identical
    /// to a single backend call.
    pub async fn run(
        &self,
        task: AgentTask,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentRunResult, AgentError> {
        if task.has_phases() {
            self.run_phased(task, events).await
        } else {
            let outcome = self.call(task, events).await?;
            Ok(AgentRunResult::from_single(outcome))
        }
    }

    /// One throttled, timed, retried backend call.
    async fn call(
        &self,
        task: AgentTask,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutcome, AgentError> {
        retry::with_backoff(&self.retry, |_attempt| {
            let task = task.clone();
            let events = events.clone();
            async move {
                self.bucket.acquire().await;
                let timeout_secs = task.timeout.as_secs();
                match tokio::time::timeout(task.timeout, self.backend.stream(task, events)).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout { timeout_secs }),
                }
            }
        })
        .await
    }

    async fn run_phased(
        &self,
        task: AgentTask,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentRunResult, AgentError> {
        let mut calls = Vec::new();
        let mut transcript = Vec::new();
        let mut explore_summary: Option<String> = None;
        let mut plan: Option<String> = None;

        if !task.explore_model.is_empty() {
            let _ = events
                .send(AgentEvent::PhaseStarted {
                    phase: "explore".to_string(),
                })
                .await;
            let mut explore = single_phase(&task);
            explore.model = task.explore_model.clone();
            explore.allowed_tools = tool_list(READ_ONLY_TOOLS);
            explore.user_prompt = format!(
                "{}\n\nSurvey the code relevant to this task and summarise what you find. \
                 Do not make any changes.",
                task.user_prompt
            );
            let outcome = self.call(explore, events.clone()).await?;
            record(&mut calls, &mut transcript, &outcome);
            explore_summary = Some(outcome.output);
            let _ = events
                .send(AgentEvent::PhaseCompleted {
                    phase: "explore".to_string(),
                })
                .await;
        }

        if !task.plan_model.is_empty() {
            let _ = events
                .send(AgentEvent::PhaseStarted {
                    phase: "plan".to_string(),
                })
                .await;
            let mut planner = single_phase(&task);
            planner.model = task.plan_model.clone();
            planner.allowed_tools = Vec::new();
            planner.user_prompt = match &explore_summary {
                Some(summary) => format!(
                    "{}\n\n## Exploration findings\n{}\n\nProduce a concrete step-by-step plan.",
                    task.user_prompt, summary
                ),
                None => format!("{}\n\nProduce a concrete step-by-step plan.", task.user_prompt),
            };
            let outcome = self.call(planner, events.clone()).await?;
            record(&mut calls, &mut transcript, &outcome);
            plan = Some(outcome.output);
            let _ = events
                .send(AgentEvent::PhaseCompleted {
                    phase: "plan".to_string(),
                })
                .await;
        }

        let _ = events
            .send(AgentEvent::PhaseStarted {
                phase: "act".to_string(),
            })
            .await;
        let mut act = single_phase(&task);
        let mut prompt = task.user_prompt.clone();
        if let Some(summary) = &explore_summary {
            prompt.push_str("\n\n## Exploration findings\n");
            prompt.push_str(summary);
        }
        if let Some(plan) = &plan {
            prompt.push_str("\n\n## Plan\n");
            prompt.push_str(plan);
        }
        act.user_prompt = prompt;
        let outcome = self.call(act, events.clone()).await?;
        record(&mut calls, &mut transcript, &outcome);
        let _ = events
            .send(AgentEvent::PhaseCompleted {
                phase: "act".to_string(),
            })
            .await;

        Ok(AgentRunResult {
            output: outcome.output,
            conversation: Value::Array(transcript),
            calls,
        })
    }
}

/// A copy of the task with phase models cleared, so nested calls stay
/// single-phase.
fn single_phase(task: &AgentTask) -> AgentTask {
    let mut t = task.clone();
    t.explore_model.clear();
    t.plan_model.clear();
    t
}

fn record(calls: &mut Vec<ModelCall>, transcript: &mut Vec<Value>, outcome: &AgentOutcome) {
    calls.push(ModelCall {
        model_id: outcome.model_id.clone(),
        input_tokens: outcome.input_tokens,
        output_tokens: outcome.output_tokens,
    });
    transcript.push(outcome.conversation.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use scripted::ScriptedBackend;
    use std::path::PathBuf;

    fn runner(backend: ScriptedBackend) -> AgentRunner {
        AgentRunner::new(
            Arc::new(backend),
            Arc::new(TokenBucket::per_minute(6000)),
            RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 0,
            },
        )
    }

    fn sink() -> mpsc::Sender<AgentEvent> {
        mpsc::channel(64).0
    }

    #[tokio::test]
    async fn single_phase_run_returns_one_call() {
        let backend = ScriptedBackend::new();
        backend.push_output("verifier", "looks good");
        let runner = runner(backend);
        let task = AgentTask::new("verifier", "m", PathBuf::from("/tmp"));
        let result = runner.run(task, sink()).await.unwrap();
        assert_eq!(result.output, "looks good");
        assert_eq!(result.calls.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_to_success() {
        let backend = ScriptedBackend::new();
        backend.push_rate_limit("code_writer");
        backend.push_output("code_writer", "recovered");
        let runner = runner(backend);
        let task = AgentTask::new("code_writer", "m", PathBuf::from("/tmp"));
        let result = runner.run(task, sink()).await.unwrap();
        assert_eq!(result.output, "recovered");
    }

    #[tokio::test]
    async fn three_phase_run_makes_three_calls() {
        let backend = ScriptedBackend::new();
        backend.push_output("coder", "explored the module");
        backend.push_output("coder", "plan: two steps");
        backend.push_output("coder", "implemented");
        let runner = runner(backend.clone());

        let mut task = AgentTask::new("coder", "m-act", PathBuf::from("/tmp"));
        task.user_prompt = "add the endpoint".to_string();
        task.explore_model = "m-explore".to_string();
        task.plan_model = "m-plan".to_string();
        task.allowed_tools = tool_list(ALL_TOOLS);

        let result = runner.run(task, sink()).await.unwrap();
        assert_eq!(result.output, "implemented");
        assert_eq!(result.calls.len(), 3);

        let seen = backend.tasks_seen();
        assert_eq!(seen[0].model, "m-explore");
        assert_eq!(seen[0].allowed_tools, tool_list(READ_ONLY_TOOLS));
        assert_eq!(seen[1].model, "m-plan");
        assert!(seen[1].allowed_tools.is_empty());
        assert!(seen[1].user_prompt.contains("explored the module"));
        assert_eq!(seen[2].model, "m-act");
        assert_eq!(seen[2].allowed_tools, tool_list(ALL_TOOLS));
        assert!(seen[2].user_prompt.contains("plan: two steps"));
    }

    #[tokio::test]
    async fn empty_plan_model_skips_plan_phase() {
        let backend = ScriptedBackend::new();
        backend.push_output("coder", "explored");
        backend.push_output("coder", "done");
        let runner = runner(backend.clone());

        let mut task = AgentTask::new("coder", "m", PathBuf::from("/tmp"));
        task.explore_model = "m-explore".to_string();
        let result = runner.run(task, sink()).await.unwrap();
        assert_eq!(result.calls.len(), 2);
        assert!(backend.tasks_seen()[1].user_prompt.contains("explored"));
    }
}
