//! Shared context handed to stage bodies.
//!
//! Bundles the store, bus, registry, agent runner, and filesystem layout,
//! plus the helpers stages use for every agent invocation: nudge
//! consumption, live event forwarding, conversation persistence, and
//! cost recording at fan-in.

use crate::agent::{AgentRunResult, AgentRunner, ModelCall};
use crate::bus::EventBus;
use crate::errors::PipelineError;
use crate::intervene::InterventionRegistry;
use crate::prompt::templates;
use crate::store::RunStore;
use gantry_common::agent::{AgentEvent, AgentTask};
use gantry_common::cr::RepoContext;
use gantry_common::event::EventKind;
use gantry_common::intervention::InterventionKind;
use gantry_common::state::PipelineState;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cap on text forwarded into `agent_output` events.
const OUTPUT_EVENT_CAP: usize = 500;

#[derive(Clone)]
pub struct StageContext {
    pub cr_id: String,
    pub store: RunStore,
    pub bus: EventBus,
    pub registry: InterventionRegistry,
    pub runner: AgentRunner,
    pub runs_dir: PathBuf,
    pub clones_dir: PathBuf,
}

impl StageContext {
    pub fn emit(&self, stage: &str, kind: EventKind) -> Result<(), PipelineError> {
        self.bus.append(&self.cr_id, stage, kind)?;
        Ok(())
    }

    /// Build an agent task for a role, wired with the run's model config
    /// and a `{stage}:{repo}:{role}` conversation key.
    pub fn build_task(
        &self,
        role: &str,
        stage: &str,
        state: &PipelineState,
        repo: Option<&RepoContext>,
    ) -> AgentTask {
        let working_dir = repo
            .and_then(|r| r.worktree_path.clone())
            .unwrap_or_else(|| self.runs_dir.join(&self.cr_id));
        let mut task = AgentTask::new(role, &state.config.model, working_dir);
        task.system_prompt = templates::for_role(role).unwrap_or_default().to_string();
        task.explore_model = state.config.explore_model.clone();
        task.plan_model = state.config.plan_model.clone();
        task.timeout = Duration::from_secs(state.config.agent_timeout_secs);
        task.allowed_tools = crate::agent::tool_list(crate::agent::ALL_TOOLS);
        task.conversation_key = format!(
            "{}:{}:{}",
            stage,
            repo.map(|r| r.repo_name.as_str()).unwrap_or("-"),
            role
        );
        task
    }

    /// Run an agent task: consume any pending nudge for the role, forward
    /// live events onto the bus, persist the conversation, and return the
    /// result with its per-model accounting.
    ///
    /// Cost is *not* recorded here — fan-out sub-tasks return their
    /// [`ModelCall`]s as part of the delta and the stage records them at
    /// fan-in via [`StageContext::record_cost`].
    pub async fn invoke_agent(
        &self,
        stage: &str,
        repo: Option<&str>,
        mut task: AgentTask,
    ) -> Result<AgentRunResult, PipelineError> {
        // Nudges are observed between agent invocations, keyed by role.
        if let Some(nudge) =
            self.registry
                .get_and_delete(&self.cr_id, InterventionKind::Nudge, &task.role)?
        {
            self.emit(
                stage,
                EventKind::AgentNudge {
                    role: task.role.clone(),
                    message: nudge.clone(),
                },
            )?;
            task.user_prompt
                .push_str(&format!("\n\n# Operator nudge\n{}", nudge));
        }

        self.emit(
            stage,
            EventKind::AgentStarted {
                role: task.role.clone(),
                repo: repo.map(|r| r.to_string()),
            },
        )?;

        let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(64);
        let forwarder = {
            let bus = self.bus.clone();
            let cr_id = self.cr_id.clone();
            let stage = stage.to_string();
            let role = task.role.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    let kind = match event {
                        AgentEvent::ToolCall { tool, input } => Some(EventKind::AgentToolCall {
                            role: role.clone(),
                            tool,
                            summary: truncate(&input.to_string(), OUTPUT_EVENT_CAP),
                        }),
                        AgentEvent::Output { text } => Some(EventKind::AgentOutput {
                            role: role.clone(),
                            text: truncate(&text, OUTPUT_EVENT_CAP),
                        }),
                        AgentEvent::PhaseStarted { phase } => {
                            Some(EventKind::PhaseStarted { phase })
                        }
                        AgentEvent::PhaseCompleted { phase } => {
                            Some(EventKind::PhaseCompleted { phase })
                        }
                        // Started/Completed are emitted by invoke_agent
                        // itself; ToolResult is too noisy for the stream.
                        AgentEvent::AgentStarted { .. }
                        | AgentEvent::AgentCompleted { .. }
                        | AgentEvent::ToolResult { .. } => None,
                    };
                    if let Some(kind) = kind {
                        let _ = bus.append(&cr_id, &stage, kind);
                    }
                }
            })
        };

        let role = task.role.clone();
        let conversation_key = task.conversation_key.clone();
        let result = self.runner.run(task, event_tx).await;
        let _ = forwarder.await;

        let result = result.map_err(|source| PipelineError::Agent {
            stage: stage.to_string(),
            source,
        })?;

        if !conversation_key.is_empty() {
            self.store
                .save_conversation(&self.cr_id, &conversation_key, &result.conversation)?;
        }

        for call in &result.calls {
            self.emit(
                stage,
                EventKind::AgentCompleted {
                    role: role.clone(),
                    repo: repo.map(|r| r.to_string()),
                    model: call.model_id.clone(),
                    input_tokens: call.input_tokens,
                    output_tokens: call.output_tokens,
                },
            )?;
        }
        Ok(result)
    }

    /// Price model calls from the run's frozen table, fold them into the
    /// state ledger and the run record, and emit a `cost_update`.
    pub fn record_cost(
        &self,
        stage: &str,
        state: &mut PipelineState,
        calls: &[ModelCall],
    ) -> Result<(), PipelineError> {
        for call in calls {
            if !state.config.prices.contains(&call.model_id) {
                tracing::warn!(model = %call.model_id, "no price entry; accounting 0 USD");
            }
            let delta_usd =
                state
                    .config
                    .prices
                    .cost_usd(&call.model_id, call.input_tokens, call.output_tokens);
            state
                .cost
                .record(&call.model_id, call.input_tokens, call.output_tokens, delta_usd);
            self.store
                .increment_cost(&self.cr_id, delta_usd, call.input_tokens, call.output_tokens)?;
            self.emit(
                stage,
                EventKind::CostUpdate {
                    delta_usd,
                    cost_usd: state.cost.usd,
                    input_tokens: state.cost.input_tokens,
                    output_tokens: state.cost.output_tokens,
                },
            )?;
        }
        Ok(())
    }
}


fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(cap).collect();
        format!("{}...", truncated)
    }
}
