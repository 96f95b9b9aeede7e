//! Worktree setup: shared bare clone, per-CR worktree, feature branch,
//! conventions file, and directory tree snapshot per repository.

use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use crate::gitops;
use gantry_common::state::PipelineState;

/// Depth captured into the tree snapshot.
const TREE_DEPTH: usize = 3;

pub async fn run(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    for repo in &mut state.repos {
        let bare = gitops::ensure_bare_clone(&ctx.clones_dir, &repo.repo_url)
            .await
            .map_err(|e| PipelineError::Git {
                repo: repo.repo_name.clone(),
                message: format!("{:#}", e),
            })?;
        let worktree = gitops::create_worktree(
            &bare,
            &ctx.runs_dir,
            &ctx.cr_id,
            &repo.repo_name,
            &repo.default_branch,
        )
        .await
        .map_err(|e| PipelineError::Git {
            repo: repo.repo_name.clone(),
            message: format!("{:#}", e),
        })?;

        repo.conventions = gitops::read_conventions(&worktree);
        repo.tree_snapshot = gitops::tree_snapshot(&worktree, TREE_DEPTH);
        repo.worktree_path = Some(worktree);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use crate::executor::context::test_support::scripted_context;
    use crate::gitops::run_git;
    use gantry_common::cr::RepoContext;
    use gantry_common::snapshot::ConfigSnapshot;
    use gantry_common::state::PipelineState;
    use tempfile::TempDir;

    async fn upstream_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run_git(dir.path(), &["init", "-b", "main"]).await.unwrap();
        run_git(dir.path(), &["config", "user.email", "t@e.c"]).await.unwrap();
        run_git(dir.path(), &["config", "user.name", "t"]).await.unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn x() {}\n").unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Always run the tests.\n").unwrap();
        run_git(dir.path(), &["add", "-A"]).await.unwrap();
        run_git(dir.path(), &["commit", "-m", "init"]).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn sets_up_worktree_conventions_and_tree() {
        let upstream = upstream_repo().await;
        let (ctx, _backend) = scripted_context();

        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        state
            .repos
            .push(RepoContext::new(upstream.path().to_str().unwrap(), "main"));

        let state = super::run(&ctx, state).await.unwrap();
        let repo = &state.repos[0];
        let worktree = repo.worktree_path.as_ref().unwrap();
        assert!(worktree.join("src/lib.rs").exists());
        assert!(worktree.ends_with(format!("{}/{}", ctx.cr_id, repo.repo_name)));
        assert_eq!(repo.conventions, "Always run the tests.\n");
        assert!(repo.tree_snapshot.contains("src/"));
        assert!(repo.tree_snapshot.contains("lib.rs"));
    }

    #[tokio::test]
    async fn unreachable_repo_is_a_git_error() {
        let (ctx, _backend) = scripted_context();
        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        state
            .repos
            .push(RepoContext::new("/nonexistent/repo.git", "main"));
        let err = super::run(&ctx, state).await.unwrap_err();
        assert!(matches!(err, crate::errors::PipelineError::Git { .. }));
    }
}
