//! The twelve stage node bodies.
//!
//! Each stage is a function from input state to output state. Per-repo
//! stages fan out one sub-task per repository through [`fan_out`]; the
//! fan-in barrier is unconditional. Routing lives in `executor::routing`,
//! not here — bodies only update state.

pub mod behaviour;
pub mod delivery;
pub mod intake;
pub mod rebase;
pub mod release;
pub mod repos;
pub mod review;
pub mod scope;
pub mod tdd;
pub mod worktree;

use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Dispatch one node body.
pub async fn run_node(
    ctx: &StageContext,
    stage: Stage,
    state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    match stage {
        Stage::Intake => intake::run(ctx, state).await,
        Stage::RepoIdentification => repos::run(ctx, state).await,
        Stage::WorktreeSetup => worktree::run(ctx, state).await,
        Stage::BehaviourTranslation => behaviour::translate(ctx, state).await,
        Stage::BehaviourVerification => behaviour::verify(ctx, state).await,
        Stage::Tdd => tdd::run(ctx, state).await,
        Stage::Review => review::run(ctx, state).await,
        Stage::Rebase => rebase::run(ctx, state).await,
        Stage::Delivery => delivery::run(ctx, state).await,
        Stage::ReleaseGate => release::gate(ctx, state).await,
        Stage::Release => release::run(ctx, state).await,
        Stage::Retrospective => release::retrospective(ctx, state).await,
    }
}

/// Spawn one concurrent sub-task per repository and await all of them.
///
/// Sub-tasks receive an immutable snapshot of the pre-stage state and
/// return `(repo_name, delta)`; the caller merges deltas at fan-in. The
/// barrier is unconditional: every handle is awaited before any error is
/// propagated, so no repository advances while another is mid-stage.
pub async fn fan_out<T, F, Fut>(
    state: &PipelineState,
    f: F,
) -> Result<Vec<(String, T)>, PipelineError>
where
    T: Send + 'static,
    F: Fn(gantry_common::cr::RepoContext, Arc<PipelineState>) -> Fut,
    Fut: Future<Output = Result<(String, T), PipelineError>> + Send + 'static,
{
    let snapshot = Arc::new(state.clone());
    let mut handles = Vec::new();
    for repo in &state.repos {
        handles.push(tokio::spawn(f(repo.clone(), Arc::clone(&snapshot))));
    }

    let mut results = Vec::new();
    let mut first_error: Option<PipelineError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(pair)) => results.push(pair),
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error =
                        Some(anyhow::anyhow!("fan-out sub-task panicked: {}", join_err).into());
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Extract the first JSON object from agent output, tolerating markdown
/// fences and prose around it.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok().filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::cr::RepoContext;
    use gantry_common::snapshot::ConfigSnapshot;

    #[test]
    fn extract_json_direct_and_embedded() {
        assert!(extract_json(r#"{"verified": true}"#).is_some());
        let fenced = "Here you go:\n```json\n{\"verified\": false}\n```\nDone.";
        let value = extract_json(fenced).unwrap();
        assert_eq!(value["verified"], false);
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[tokio::test]
    async fn fan_out_runs_one_task_per_repo() {
        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        state.repos.push(RepoContext::new("https://h/a.git", "main"));
        state.repos.push(RepoContext::new("https://h/b.git", "main"));

        let results = fan_out(&state, |repo, snapshot| async move {
            assert_eq!(snapshot.repos.len(), 2);
            Ok((repo.repo_name.clone(), repo.repo_name.len()))
        })
        .await
        .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn fan_out_awaits_all_before_reporting_error() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        state.repos.push(RepoContext::new("https://h/a.git", "main"));
        state.repos.push(RepoContext::new("https://h/b.git", "main"));

        static COMPLETED: AtomicU32 = AtomicU32::new(0);
        let err = fan_out(&state, |repo, _snapshot| async move {
            if repo.repo_name == "a" {
                Err(PipelineError::NoRepos)
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                COMPLETED.fetch_add(1, Ordering::SeqCst);
                Ok((repo.repo_name, ()))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoRepos));
        // The slow sub-task still ran to completion behind the barrier.
        assert_eq!(COMPLETED.load(Ordering::SeqCst), 1);
    }
}
