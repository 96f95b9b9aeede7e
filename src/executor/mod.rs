//! Graph Executor: drives one CR run through the stage graph.
//!
//! Claims the run with a status CAS (losing the CAS means another worker
//! owns it — exit silently), restores the newest checkpoint, applies any
//! resume overrides, then loops: consume interventions, run the node
//! under the stage timeout, checkpoint, route. The pipeline never
//! auto-transitions to `failed`; fatal node errors pause with `error`
//! set and the human decides.

pub mod context;
pub mod routing;

use crate::bus::EventBus;
use crate::errors::PipelineError;
use crate::intervene::InterventionRegistry;
use crate::stages;
use crate::store::RunStore;
use chrono::Utc;
use context::StageContext;
use gantry_common::cr::TriggerRequest;
use gantry_common::event::EventKind;
use gantry_common::intervention::InterventionKind;
use gantry_common::run::{PauseReason, RunStatus};
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;
use routing::{Next, route};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Append one line to the per-run log backing the `get_logs` endpoint.
pub fn append_run_log(runs_dir: &Path, cr_id: &str, line: &str) -> anyhow::Result<()> {
    let dir = runs_dir.join(cr_id);
    std::fs::create_dir_all(&dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("run.log"))?;
    writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), line)?;
    Ok(())
}

/// Loop context carried into a re-entered stage's `stage_entered` event
/// and visible to its agents.
fn entry_context(stage: Stage, state: &PipelineState) -> Option<String> {
    match stage {
        Stage::BehaviourTranslation if state.behaviour.verification_loops > 0 => {
            let feedback = state.behaviour.loop_feedback();
            (!feedback.is_empty()).then_some(feedback)
        }
        Stage::Tdd => {
            let mut parts = Vec::new();
            if state.review.review_loops > 0 {
                let feedback = state.review.loop_feedback();
                if !feedback.is_empty() {
                    parts.push(feedback);
                }
            }
            if !state.delivery.ci_logs.is_empty() {
                parts.push(state.delivery.ci_logs.clone());
            }
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

#[derive(Clone)]
pub struct Executor {
    store: RunStore,
    bus: EventBus,
    registry: InterventionRegistry,
    runner: crate::agent::AgentRunner,
    runs_dir: PathBuf,
    clones_dir: PathBuf,
}

impl Executor {
    pub fn new(
        store: RunStore,
        bus: EventBus,
        registry: InterventionRegistry,
        runner: crate::agent::AgentRunner,
        runs_dir: PathBuf,
        clones_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            runner,
            runs_dir,
            clones_dir,
        }
    }

    fn ctx(&self, cr_id: &str) -> StageContext {
        StageContext {
            cr_id: cr_id.to_string(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            runner: self.runner.clone(),
            runs_dir: self.runs_dir.clone(),
            clones_dir: self.clones_dir.clone(),
        }
    }

    /// Execute the run graph for one CR from its newest checkpoint.
    pub async fn run(&self, cr_id: &str) -> Result<(), PipelineError> {
        let run = self.store.get_run(cr_id)?;
        if run.status.is_terminal() {
            return Ok(());
        }

        // Ownership: exactly one worker wins the CAS. Losing it is not an
        // error and not logged as one.
        let claimed = self.store.update_status(cr_id, RunStatus::Pending, RunStatus::Running)?
            || self.store.update_status(cr_id, RunStatus::Paused, RunStatus::Running)?;
        if !claimed {
            tracing::debug!(cr_id, "run already owned elsewhere; exiting");
            return Ok(());
        }

        let overrides = self.registry.take_overrides(cr_id)?;
        let checkpoint = self.store.latest_checkpoint(cr_id)?;
        let ctx = self.ctx(cr_id);

        let (mut state, mut next, fresh) = match checkpoint {
            None => {
                let (snapshot, request_json) = self.store.get_run_inputs(cr_id)?;
                let request: TriggerRequest =
                    serde_json::from_value(request_json).unwrap_or_default();
                let mut state =
                    PipelineState::new(&run.title, &request.raw_description(), snapshot);
                state.repos = request.repo_contexts();
                (state, Next::Stage(Stage::first()), true)
            }
            Some((node_name, mut state)) => {
                // Resume node: the node after the checkpointed one, unless
                // overrides re-anchor routing at a later gate.
                let anchor = match &overrides {
                    Some(o) => o.anchor_stage(),
                    None => None,
                };
                if let Some(o) = &overrides {
                    state.apply_overrides(o);
                }
                let anchor = anchor
                    .or_else(|| Stage::from_str(&node_name).ok())
                    .unwrap_or(Stage::Intake);
                let next = route(anchor, &state);
                (state, next, false)
            }
        };

        if fresh {
            self.bus.append(
                cr_id,
                "pipeline",
                EventKind::PipelineStarted {
                    title: run.title.clone(),
                },
            )?;
        } else {
            self.bus.append(cr_id, "pipeline", EventKind::PipelineResumed {})?;
        }
        let _ = append_run_log(
            &self.runs_dir,
            cr_id,
            if fresh { "pipeline started" } else { "pipeline resumed" },
        );

        loop {
            let stage = match next {
                Next::Stage(stage) => stage,
                Next::Paused(reason) => {
                    let detail = pause_detail(reason, &state);
                    return self.pause(cr_id, &run_stage_label(&state, reason), reason, detail);
                }
                Next::Done => {
                    return self.complete(cr_id, &state);
                }
            };

            // Interventions are observed between every two node
            // invocations.
            if let Some(text) =
                self.registry
                    .get_and_delete(cr_id, InterventionKind::Instructions, "")?
            {
                state.absorb_intervention(&text);
            }

            self.store.record_stage(cr_id, stage.as_str())?;
            self.bus.append(
                cr_id,
                stage.as_str(),
                EventKind::StageEntered {
                    context: entry_context(stage, &state),
                },
            )?;
            let _ = append_run_log(&self.runs_dir, cr_id, &format!("entering {}", stage));

            let timeout = Duration::from_secs(state.config.stage_timeout_secs);
            let node_result =
                tokio::time::timeout(timeout, stages::run_node(&ctx, stage, state.clone())).await;

            match node_result {
                Err(_elapsed) => {
                    return self.pause(
                        cr_id,
                        stage.as_str(),
                        PauseReason::StageTimeout,
                        Some(format!("stage {} exceeded {}s", stage, timeout.as_secs())),
                    );
                }
                Ok(Err(e)) => {
                    let error = format!("{:#}", anyhow::Error::new(e));
                    tracing::error!(cr_id, stage = %stage, error = %error, "node failed");
                    self.bus.append(
                        cr_id,
                        stage.as_str(),
                        EventKind::PipelineFailed {
                            error: error.clone(),
                        },
                    )?;
                    if !self.store.update_status(cr_id, RunStatus::Running, RunStatus::Paused)? {
                        tracing::warn!(cr_id, "failed run was not in running status");
                    }
                    self.store
                        .record_pause(cr_id, PauseReason::NodeError, Some(&error))?;
                    let _ = append_run_log(
                        &self.runs_dir,
                        cr_id,
                        &format!("node {} failed: {}", stage, error),
                    );
                    return Ok(());
                }
                Ok(Ok(new_state)) => {
                    state = new_state;
                }
            }

            self.bus
                .append(cr_id, stage.as_str(), EventKind::StageCompleted {})?;
            self.store.write_checkpoint(cr_id, stage.as_str(), &state)?;

            // Cost circuit breaker.
            if let Some(max) = state.config.max_cost_usd
                && state.cost.usd >= max
            {
                return self.pause(
                    cr_id,
                    stage.as_str(),
                    PauseReason::CostLimit,
                    Some(format!("cost ${:.2} reached the ${:.2} limit", state.cost.usd, max)),
                );
            }

            next = route(stage, &state);
        }
    }

    fn pause(
        &self,
        cr_id: &str,
        stage_label: &str,
        reason: PauseReason,
        detail: Option<String>,
    ) -> Result<(), PipelineError> {
        if !self.store.update_status(cr_id, RunStatus::Running, RunStatus::Paused)? {
            tracing::warn!(cr_id, "paused run was not in running status");
        }
        self.store.record_pause(cr_id, reason, detail.as_deref())?;
        self.store.record_current_stage(cr_id, stage_label)?;
        self.bus.append(
            cr_id,
            stage_label,
            EventKind::PipelinePaused { reason, detail },
        )?;
        let _ = append_run_log(
            &self.runs_dir,
            cr_id,
            &format!("paused at {} ({})", stage_label, reason),
        );
        Ok(())
    }

    fn complete(&self, cr_id: &str, state: &PipelineState) -> Result<(), PipelineError> {
        if !self.store.update_status(cr_id, RunStatus::Running, RunStatus::Completed)? {
            tracing::warn!(cr_id, "completed run was not in running status");
        }
        self.bus.append(
            cr_id,
            "pipeline",
            EventKind::PipelineCompleted {
                cost_usd: state.cost.usd,
            },
        )?;
        let _ = append_run_log(&self.runs_dir, cr_id, "pipeline completed");
        Ok(())
    }
}

/// Stage recorded on a routed pause: the node the pause occurred in.
fn run_stage_label(_state: &PipelineState, reason: PauseReason) -> String {
    let stage = match reason {
        PauseReason::NoRepos => Stage::RepoIdentification,
        PauseReason::VerificationLoopLimit => Stage::BehaviourVerification,
        PauseReason::ReviewLoopLimit | PauseReason::TddLoopLimit => Stage::Review,
        PauseReason::RebaseConflict => Stage::Rebase,
        PauseReason::WaitingCi | PauseReason::CiLoopLimit => Stage::Delivery,
        PauseReason::WaitingApproval | PauseReason::OperatorRequest => Stage::ReleaseGate,
        _ => return "pipeline".to_string(),
    };
    stage.as_str().to_string()
}

fn pause_detail(reason: PauseReason, state: &PipelineState) -> Option<String> {
    match reason {
        PauseReason::NoRepos => Some("no repositories specified in the trigger payload".to_string()),
        PauseReason::RebaseConflict => {
            let detail = state
                .rebase
                .conflicts
                .iter()
                .map(|(repo, context)| format!("{}: {}", repo, context))
                .collect::<Vec<_>>()
                .join("; ");
            (!detail.is_empty()).then_some(detail)
        }
        PauseReason::VerificationLoopLimit => {
            let feedback = state.behaviour.loop_feedback();
            (!feedback.is_empty()).then_some(feedback)
        }
        PauseReason::ReviewLoopLimit => {
            let feedback = state.review.loop_feedback();
            (!feedback.is_empty()).then_some(feedback)
        }
        _ => None,
    }
}
