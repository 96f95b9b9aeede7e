//! Behaviour translation and verification.
//!
//! Translation writes Gherkin specs per repo in parallel; verification
//! judges them per repo in parallel, then a serial cross-repo consistency
//! check sees all specs together. The composite verdict requires every
//! repo verified and the consistency check passed.

use super::{extract_json, fan_out};
use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use crate::gitops;
use crate::prompt::{PromptBuilder, render_cr};
use gantry_common::agent::AgentError;
use gantry_common::stage::Stage;
use gantry_common::state::{PipelineState, SpecMeta, VerificationVerdict};
use serde::Deserialize;

/// Cap on the spec summary carried in state for cross-repo checks.
const SUMMARY_CAP: usize = 1200;

pub async fn translate(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let stage = Stage::BehaviourTranslation.as_str();
    let cr_text = render_cr(&state.cr_or_raw());
    let feedback = if state.behaviour.verification_loops > 0 {
        state.behaviour.loop_feedback()
    } else {
        String::new()
    };

    let results = fan_out(&state, |repo, snapshot| {
        let ctx = ctx.clone();
        let cr_text = cr_text.clone();
        let feedback = feedback.clone();
        async move {
            let mut task = ctx.build_task("spec_writer", stage, &snapshot, Some(&repo));
            task.user_prompt = PromptBuilder::new(snapshot.config.repo_context_token_cap)
                .repo_context(&repo)
                .task("Change request", &cr_text)
                .loop_context("Verification feedback from the previous attempt", &feedback)
                .intervention(snapshot.intervention.as_deref())
                .build();

            let result = ctx.invoke_agent(stage, Some(&repo.repo_name), task).await?;

            if let Some(worktree) = &repo.worktree_path {
                // Safety net; the spec writer normally commits its own work.
                if let Err(e) = gitops::commit_all(worktree, "Add behaviour specs").await {
                    tracing::warn!(repo = %repo.repo_name, error = %format!("{:#}", e), "spec commit failed");
                }
            }

            let feature_files = repo
                .worktree_path
                .as_deref()
                .map(|worktree| {
                    walkdir::WalkDir::new(worktree)
                        .into_iter()
                        .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
                        .flatten()
                        .filter(|e| {
                            e.file_type().is_file()
                                && e.path().extension().is_some_and(|ext| ext == "feature")
                        })
                        .filter_map(|e| {
                            e.path()
                                .strip_prefix(worktree)
                                .ok()
                                .map(|p| p.to_string_lossy().to_string())
                        })
                        .collect()
                })
                .unwrap_or_default();

            let summary: String = result.output.chars().take(SUMMARY_CAP).collect();
            let meta = SpecMeta {
                feature_files,
                summary,
            };
            Ok((repo.repo_name.clone(), (meta, result.calls)))
        }
    })
    .await?;

    for (repo_name, (meta, calls)) in results {
        ctx.record_cost(stage, &mut state, &calls)?;
        state.behaviour.specs.insert(repo_name, meta);
    }
    Ok(state)
}

#[derive(Debug, Deserialize)]
struct ConsistencyVerdict {
    consistent: bool,
    #[serde(default)]
    issues: Vec<String>,
}

pub async fn verify(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let stage = Stage::BehaviourVerification.as_str();
    let cr_text = render_cr(&state.cr_or_raw());

    let results = fan_out(&state, |repo, snapshot| {
        let ctx = ctx.clone();
        let cr_text = cr_text.clone();
        async move {
            let spec_files = snapshot
                .behaviour
                .specs
                .get(&repo.repo_name)
                .map(|meta| meta.feature_files.join("\n"))
                .unwrap_or_default();

            let mut task = ctx.build_task("verifier", stage, &snapshot, Some(&repo));
            task.user_prompt = PromptBuilder::new(snapshot.config.repo_context_token_cap)
                .repo_context(&repo)
                .task("Change request", &cr_text)
                .task("Spec files to verify", &spec_files)
                .intervention(snapshot.intervention.as_deref())
                .build();

            let result = ctx.invoke_agent(stage, Some(&repo.repo_name), task).await?;
            let verdict: VerificationVerdict = extract_json(&result.output)
                .and_then(|value| serde_json::from_value(value).ok())
                .ok_or_else(|| PipelineError::Agent {
                    stage: stage.to_string(),
                    source: AgentError::Parse(format!(
                        "verifier output for {} is not a verdict",
                        repo.repo_name
                    )),
                })?;
            Ok((repo.repo_name.clone(), (verdict, result.calls)))
        }
    })
    .await?;

    for (repo_name, (verdict, calls)) in results {
        ctx.record_cost(stage, &mut state, &calls)?;
        state.behaviour.verdicts.insert(repo_name, verdict);
    }
    let all_verified = state.behaviour.verdicts.values().all(|v| v.verified);

    // Serial consistency check after fan-in, seeing all specs together.
    let consistency_passed = if state.repos.len() > 1 {
        let summaries = state
            .behaviour
            .specs
            .iter()
            .map(|(repo, meta)| format!("## {}\n{}", repo, meta.summary))
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut task = ctx.build_task("consistency_checker", stage, &state, None);
        task.allowed_tools.clear();
        task.user_prompt = PromptBuilder::new(state.config.repo_context_token_cap)
            .task("Change request", &cr_text)
            .task("Per-repository spec summaries", &summaries)
            .build();
        let result = ctx.invoke_agent(stage, None, task).await?;
        let calls = result.calls.clone();
        let verdict: ConsistencyVerdict = extract_json(&result.output)
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| PipelineError::Agent {
                stage: stage.to_string(),
                source: AgentError::Parse("consistency output is not a verdict".to_string()),
            })?;
        ctx.record_cost(stage, &mut state, &calls)?;
        if !verdict.consistent {
            for issue in &verdict.issues {
                tracing::warn!(issue = %issue, "cross-repo inconsistency");
            }
        }
        verdict.consistent
    } else {
        true
    };

    state.behaviour.consistency_passed = Some(consistency_passed);
    state.behaviour.verified = all_verified && consistency_passed;
    if !state.behaviour.verified {
        state.behaviour.verification_loops += 1;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use crate::executor::context::test_support::scripted_context;
    use gantry_common::cr::RepoContext;
    use gantry_common::snapshot::ConfigSnapshot;
    use gantry_common::state::PipelineState;

    fn state_with_repos(names: &[&str]) -> PipelineState {
        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        for name in names {
            state
                .repos
                .push(RepoContext::new(&format!("https://h/{}.git", name), "main"));
        }
        state
    }

    #[tokio::test]
    async fn translate_collects_spec_summaries_per_repo() {
        let (ctx, backend) = scripted_context();
        backend.push_output("spec_writer", "covered login and logout");
        backend.push_output("spec_writer", "covered billing");
        let state = state_with_repos(&["api", "web"]);

        let state = super::translate(&ctx, state).await.unwrap();
        assert_eq!(state.behaviour.specs.len(), 2);
        assert!(state.behaviour.specs.contains_key("api"));
        assert!(state.behaviour.specs.contains_key("web"));
    }

    #[tokio::test]
    async fn translate_includes_feedback_on_reentry() {
        let (ctx, backend) = scripted_context();
        let mut state = state_with_repos(&["api"]);
        state.behaviour.verification_loops = 1;
        state.behaviour.verdicts.insert(
            "api".to_string(),
            gantry_common::state::VerificationVerdict {
                verified: false,
                feedback: "missing timeout scenario".to_string(),
                ..Default::default()
            },
        );

        super::translate(&ctx, state).await.unwrap();
        let seen = backend.tasks_for("spec_writer");
        assert!(seen[0].user_prompt.contains("missing timeout scenario"));
    }

    #[tokio::test]
    async fn verify_single_repo_verified() {
        let (ctx, backend) = scripted_context();
        backend.push_json(
            "verifier",
            serde_json::json!({"verified": true, "feedback": "", "missing_scenarios": [], "issues": []}),
        );
        let state = state_with_repos(&["api"]);
        let state = super::verify(&ctx, state).await.unwrap();
        assert!(state.behaviour.verified);
        assert_eq!(state.behaviour.verification_loops, 0);
        assert_eq!(state.behaviour.consistency_passed, Some(true));
    }

    #[tokio::test]
    async fn verify_failure_increments_loop_counter() {
        let (ctx, backend) = scripted_context();
        backend.push_json(
            "verifier",
            serde_json::json!({"verified": false, "feedback": "missing X"}),
        );
        let state = state_with_repos(&["api"]);
        let state = super::verify(&ctx, state).await.unwrap();
        assert!(!state.behaviour.verified);
        assert_eq!(state.behaviour.verification_loops, 1);
        assert_eq!(
            state.behaviour.verdicts["api"].feedback,
            "missing X"
        );
    }

    #[tokio::test]
    async fn multi_repo_runs_consistency_check() {
        let (ctx, backend) = scripted_context();
        backend.push_json("verifier", serde_json::json!({"verified": true}));
        backend.push_json("verifier", serde_json::json!({"verified": true}));
        backend.push_json(
            "consistency_checker",
            serde_json::json!({"consistent": false, "issues": ["api and web disagree on the contract"]}),
        );
        let state = state_with_repos(&["api", "web"]);
        let state = super::verify(&ctx, state).await.unwrap();
        // Both repos verified, but the consistency check failed the composite.
        assert!(!state.behaviour.verified);
        assert_eq!(state.behaviour.consistency_passed, Some(false));
        assert_eq!(backend.tasks_for("consistency_checker").len(), 1);
    }

    #[tokio::test]
    async fn unparseable_verdict_is_a_node_failure() {
        let (ctx, backend) = scripted_context();
        backend.push_output("verifier", "I feel good about these specs");
        let state = state_with_repos(&["api"]);
        let err = super::verify(&ctx, state).await.unwrap_err();
        assert!(matches!(err, crate::errors::PipelineError::Agent { .. }));
    }
}
