//! Delivery: strategy-dependent hand-off per repository.
//!
//! `self_contained` verifies in-process; `push_and_forget` pushes and
//! returns; `push_and_wait` pushes and arms the checkpoint-and-terminate
//! pause — routing pauses with `waiting_ci` and a CI signal resumes the
//! run.

use super::fan_out;
use crate::agent::tools::WorktreeTools;
use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use crate::gitops;
use gantry_common::cr::DeliveryStrategy;
use gantry_common::event::EventKind;
use gantry_common::stage::Stage;
use gantry_common::state::{PipelineState, PushResult};

struct RepoDelivery {
    push: Option<PushResult>,
    verified: Option<bool>,
    wait: bool,
}

pub async fn run(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let stage = Stage::Delivery.as_str();
    // A fresh delivery attempt supersedes any previous CI signal.
    state.delivery.awaiting_ci = false;
    state.delivery.ci_passed = None;
    state.delivery.ci_logs.clear();

    let results = fan_out(&state, |repo, _snapshot| {
        let ctx = ctx.clone();
        async move {
            let branch = gitops::branch_name(&ctx.cr_id);
            let delta = match repo.delivery {
                DeliveryStrategy::SelfContained => {
                    let passed = match (&repo.worktree_path, &repo.test_command) {
                        (Some(worktree), Some(cmd)) => {
                            let tools = WorktreeTools::new(worktree).map_err(|e| {
                                PipelineError::Git {
                                    repo: repo.repo_name.clone(),
                                    message: format!("{:#}", e),
                                }
                            })?;
                            match tools.run_command(cmd, None).await {
                                Ok(output) => output.success(),
                                Err(_) => false,
                            }
                        }
                        _ => true,
                    };
                    ctx.emit(
                        stage,
                        EventKind::TestRun {
                            repo: repo.repo_name.clone(),
                            passed,
                            summary: "delivery verification".to_string(),
                        },
                    )?;
                    RepoDelivery {
                        push: None,
                        verified: Some(passed),
                        wait: false,
                    }
                }
                DeliveryStrategy::PushAndForget | DeliveryStrategy::PushAndWait => {
                    let worktree = repo.worktree_path.as_ref().ok_or_else(|| {
                        PipelineError::Git {
                            repo: repo.repo_name.clone(),
                            message: "no worktree to push from".to_string(),
                        }
                    })?;
                    gitops::push_branch(worktree, &branch).await.map_err(|e| {
                        PipelineError::Git {
                            repo: repo.repo_name.clone(),
                            message: format!("{:#}", e),
                        }
                    })?;
                    RepoDelivery {
                        push: Some(PushResult {
                            branch: branch.clone(),
                            pushed: true,
                            pr_url: None,
                        }),
                        verified: None,
                        wait: repo.delivery == DeliveryStrategy::PushAndWait,
                    }
                }
            };
            Ok((repo.repo_name.clone(), delta))
        }
    })
    .await?;

    let mut any_wait = false;
    for (repo_name, delta) in results {
        if let Some(push) = delta.push {
            state.delivery.push_results.insert(repo_name.clone(), push);
        }
        if let Some(verified) = delta.verified {
            state.delivery.verification.insert(repo_name.clone(), verified);
        }
        any_wait |= delta.wait;
    }
    state.delivery.all_verified = state.delivery.verification.values().all(|v| *v);
    state.delivery.awaiting_ci = any_wait;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use crate::executor::context::test_support::scripted_context;
    use crate::gitops::{commit_all, create_worktree, ensure_bare_clone, run_git};
    use gantry_common::cr::{DeliveryStrategy, RepoContext};
    use gantry_common::snapshot::ConfigSnapshot;
    use gantry_common::state::PipelineState;
    use tempfile::TempDir;

    async fn upstream_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run_git(dir.path(), &["init", "-b", "main"]).await.unwrap();
        run_git(dir.path(), &["config", "user.email", "t@e.c"]).await.unwrap();
        run_git(dir.path(), &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(dir.path().join("README.md"), "# base\n").unwrap();
        run_git(dir.path(), &["add", "-A"]).await.unwrap();
        run_git(dir.path(), &["commit", "-m", "init"]).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn self_contained_runs_verification_in_process() {
        let (ctx, _backend) = scripted_context();
        let worktree = TempDir::new().unwrap();

        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        let mut repo = RepoContext::new("https://h/api.git", "main");
        repo.worktree_path = Some(worktree.path().to_path_buf());
        repo.test_command = Some("true".to_string());
        repo.delivery = DeliveryStrategy::SelfContained;
        state.repos.push(repo);

        let state = super::run(&ctx, state).await.unwrap();
        assert_eq!(state.delivery.verification.get("api"), Some(&true));
        assert!(state.delivery.all_verified);
        assert!(!state.delivery.awaiting_ci);
    }

    #[tokio::test]
    async fn failing_verification_clears_all_verified() {
        let (ctx, _backend) = scripted_context();
        let worktree = TempDir::new().unwrap();

        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        let mut repo = RepoContext::new("https://h/api.git", "main");
        repo.worktree_path = Some(worktree.path().to_path_buf());
        repo.test_command = Some("exit 1".to_string());
        state.repos.push(repo);

        let state = super::run(&ctx, state).await.unwrap();
        assert_eq!(state.delivery.verification.get("api"), Some(&false));
        assert!(!state.delivery.all_verified);
    }

    #[tokio::test]
    async fn push_and_wait_pushes_and_arms_the_ci_pause() {
        let upstream = upstream_repo().await;
        let (ctx, _backend) = scripted_context();
        let url = upstream.path().to_str().unwrap().to_string();
        let bare = ensure_bare_clone(&ctx.clones_dir, &url).await.unwrap();
        let worktree = create_worktree(&bare, &ctx.runs_dir, &ctx.cr_id, "demo", "main")
            .await
            .unwrap();
        run_git(&worktree, &["config", "user.email", "t@e.c"]).await.unwrap();
        run_git(&worktree, &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(worktree.join("done.txt"), "work\n").unwrap();
        commit_all(&worktree, "work").await.unwrap();

        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        let mut repo = RepoContext::new(&url, "main");
        repo.repo_name = "demo".to_string();
        repo.worktree_path = Some(worktree);
        repo.delivery = DeliveryStrategy::PushAndWait;
        state.repos.push(repo);

        let state = super::run(&ctx, state).await.unwrap();
        assert!(state.delivery.awaiting_ci);
        let push = state.delivery.push_results.get("demo").unwrap();
        assert!(push.pushed);
        assert_eq!(push.branch, format!("ai/cr-{}", ctx.cr_id));

        // The branch landed on the upstream remote.
        let branches = run_git(upstream.path(), &["branch", "--list", &push.branch])
            .await
            .unwrap();
        assert!(branches.contains(&push.branch));
    }

    #[tokio::test]
    async fn fresh_delivery_clears_stale_ci_signal() {
        let (ctx, _backend) = scripted_context();
        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        let mut repo = RepoContext::new("https://h/api.git", "main");
        repo.delivery = DeliveryStrategy::SelfContained;
        state.repos.push(repo);
        state.delivery.ci_passed = Some(false);
        state.delivery.ci_logs = "old logs".to_string();

        let state = super::run(&ctx, state).await.unwrap();
        assert_eq!(state.delivery.ci_passed, None);
        assert!(state.delivery.ci_logs.is_empty());
    }
}
