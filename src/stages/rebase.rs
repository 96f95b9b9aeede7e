//! Rebase onto the latest base branch, with agent-assisted conflict
//! resolution.
//!
//! A multi-commit rebase may re-conflict on each replayed commit, so the
//! resolver runs in a loop: resolve, `rebase --continue`, repeat. After
//! the attempt budget the rebase is aborted and the repo marked dirty.

use super::fan_out;
use crate::agent::ModelCall;
use crate::agent::tools::WorktreeTools;
use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use crate::gitops::{self, RebaseOutcome};
use crate::prompt::PromptBuilder;
use gantry_common::event::EventKind;
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;

struct RepoRebase {
    clean: bool,
    conflict_context: Option<String>,
    calls: Vec<ModelCall>,
}

pub async fn run(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let stage = Stage::Rebase.as_str();

    let results = fan_out(&state, |repo, snapshot| {
        let ctx = ctx.clone();
        async move {
            let Some(worktree) = repo.worktree_path.clone() else {
                // Nothing checked out (dry runs); treat as clean.
                return Ok((
                    repo.repo_name.clone(),
                    RepoRebase { clean: true, conflict_context: None, calls: Vec::new() },
                ));
            };

            let mut outcome = gitops::rebase_onto_base(&worktree, &repo.default_branch)
                .await
                .map_err(|e| PipelineError::Git {
                    repo: repo.repo_name.clone(),
                    message: format!("{:#}", e),
                })?;

            let mut calls = Vec::new();
            let mut attempts = 0u32;
            while let RebaseOutcome::Conflicted { files } = &outcome {
                if attempts >= snapshot.config.max_rebase_attempts {
                    break;
                }
                attempts += 1;
                let file_list = files.join("\n");
                let mut task = ctx.build_task("conflict_resolver", stage, &snapshot, Some(&repo));
                task.user_prompt = PromptBuilder::new(snapshot.config.repo_context_token_cap)
                    .repo_context(&repo)
                    .task("Conflicted files", &file_list)
                    .loop_context(
                        "Attempt",
                        &format!("{} of {}", attempts, snapshot.config.max_rebase_attempts),
                    )
                    .intervention(snapshot.intervention.as_deref())
                    .build();
                let result = ctx.invoke_agent(stage, Some(&repo.repo_name), task).await?;
                calls.extend(result.calls);

                outcome = gitops::rebase_continue(&worktree)
                    .await
                    .map_err(|e| PipelineError::Git {
                        repo: repo.repo_name.clone(),
                        message: format!("{:#}", e),
                    })?;
            }

            match outcome {
                RebaseOutcome::Clean => {
                    // Full suite after a clean rebase.
                    if let (Ok(tools), Some(cmd)) =
                        (WorktreeTools::new(&worktree), repo.test_command.as_deref())
                    {
                        match tools.run_command(cmd, None).await {
                            Ok(output) => {
                                ctx.emit(
                                    stage,
                                    EventKind::TestRun {
                                        repo: repo.repo_name.clone(),
                                        passed: output.success(),
                                        summary: String::new(),
                                    },
                                )?;
                            }
                            Err(e) => {
                                tracing::warn!(repo = %repo.repo_name, error = %e, "post-rebase test run failed");
                            }
                        }
                    }
                    Ok((
                        repo.repo_name.clone(),
                        RepoRebase { clean: true, conflict_context: None, calls },
                    ))
                }
                RebaseOutcome::Conflicted { files } => {
                    gitops::rebase_abort(&worktree).await.map_err(|e| PipelineError::Git {
                        repo: repo.repo_name.clone(),
                        message: format!("{:#}", e),
                    })?;
                    Ok((
                        repo.repo_name.clone(),
                        RepoRebase {
                            clean: false,
                            conflict_context: Some(format!(
                                "unresolved after {} attempts: {}",
                                attempts,
                                files.join(", ")
                            )),
                            calls,
                        },
                    ))
                }
            }
        }
    })
    .await?;

    let mut all_clean = true;
    state.rebase.conflicts.clear();
    for (repo_name, rebase) in results {
        ctx.record_cost(stage, &mut state, &rebase.calls)?;
        if !rebase.clean {
            all_clean = false;
            if let Some(context) = rebase.conflict_context {
                state.rebase.conflicts.insert(repo_name, context);
            }
        }
    }
    state.rebase.rebase_clean = Some(all_clean);
    Ok(state)
}
