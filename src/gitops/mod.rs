//! Git plumbing for worktrees, branches, diffs, and rebases.
//!
//! Each repository gets one shared bare clone; each CR gets a worktree
//! under `runs/{cr_id}/{repo_name}` on a fresh `ai/cr-{cr_id}` branch.
//! Porcelain operations go through subprocess git; diff extraction uses
//! git2. Concurrent fetches into a bare clone are serialized with an
//! advisory file lock.

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use gantry_common::cr::repo_name_from_url;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Feature branch name for a CR.
pub fn branch_name(cr_id: &str) -> String {
    format!("ai/cr-{}", cr_id)
}

/// Run a git command, capturing output. Non-zero exit is an error carrying
/// stderr.
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run git {:?}", args))?;
    if !output.status.success() {
        bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Like [`run_git`] but success is reported, not required.
async fn try_git(dir: &Path, args: &[&str]) -> Result<bool> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("Failed to run git {:?}", args))?;
    Ok(status.success())
}

/// Ensure a bare clone of `repo_url` exists under `clones_dir` and is
/// fresh. Guarded by an advisory lock so concurrent CRs do not race the
/// clone or fetch.
pub async fn ensure_bare_clone(clones_dir: &Path, repo_url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(clones_dir).context("Failed to create clones directory")?;
    let name = repo_name_from_url(repo_url);
    let bare = clones_dir.join(format!("{}.git", name));

    let lock_path = clones_dir.join(format!("{}.lock", name));
    let lock_file = std::fs::File::create(&lock_path).context("Failed to create clone lock")?;
    lock_file.lock_exclusive().context("Failed to take clone lock")?;

    let result = async {
        if bare.exists() {
            run_git(&bare, &["fetch", "origin", "+refs/heads/*:refs/heads/*", "--prune"]).await?;
        } else {
            run_git(
                clones_dir,
                &["clone", "--bare", repo_url, bare.to_str().context("bare path not utf-8")?],
            )
            .await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    fs2::FileExt::unlock(&lock_file).ok();
    result?;
    Ok(bare)
}

/// Whether a branch exists in the (already fetched) bare clone.
pub async fn branch_exists(bare: &Path, branch: &str) -> Result<bool> {
    try_git(bare, &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)]).await
}

/// Create the per-CR worktree at `runs/{cr_id}/{repo_name}`.
///
/// Fresh runs branch `ai/cr-{cr_id}` off the default branch. After a
/// worker restart the branch already exists (possibly pushed); the
/// worktree is recreated from it so in-flight work survives.
pub async fn create_worktree(
    bare: &Path,
    runs_dir: &Path,
    cr_id: &str,
    repo_name: &str,
    default_branch: &str,
) -> Result<PathBuf> {
    let worktree = runs_dir.join(cr_id).join(repo_name);
    std::fs::create_dir_all(
        worktree
            .parent()
            .context("worktree path has no parent")?,
    )
    .context("Failed to create runs directory")?;

    let branch = branch_name(cr_id);
    if worktree.exists() {
        // Stale directory from a dead worker; git may still track it.
        let _ = try_git(bare, &["worktree", "remove", "--force", worktree.to_str().unwrap_or_default()])
            .await;
        let _ = tokio::fs::remove_dir_all(&worktree).await;
        let _ = try_git(bare, &["worktree", "prune"]).await;
    }

    let worktree_str = worktree.to_str().context("worktree path not utf-8")?;
    if branch_exists(bare, &branch).await? {
        run_git(bare, &["worktree", "add", worktree_str, &branch]).await?;
    } else {
        run_git(bare, &["worktree", "add", "-b", &branch, worktree_str, default_branch]).await?;
    }
    Ok(worktree)
}

/// Read AGENTS.md, falling back to CLAUDE.md; empty when neither exists.
pub fn read_conventions(worktree: &Path) -> String {
    for name in ["AGENTS.md", "CLAUDE.md"] {
        if let Ok(content) = std::fs::read_to_string(worktree.join(name)) {
            return content;
        }
    }
    String::new()
}

const VENDORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    ".venv",
];

/// Indented directory tree, depth-limited, excluding hidden and common
/// vendored directories.
pub fn tree_snapshot(worktree: &Path, max_depth: usize) -> String {
    let mut lines = Vec::new();
    let walker = walkdir::WalkDir::new(worktree)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.') && !VENDORED_DIRS.contains(&name.as_ref())
        });
    for entry in walker.flatten() {
        let depth = entry.depth();
        let name = entry.file_name().to_string_lossy();
        let suffix = if entry.file_type().is_dir() { "/" } else { "" };
        lines.push(format!("{}{}{}", "  ".repeat(depth - 1), name, suffix));
    }
    lines.join("\n")
}

/// Unified diff of the worktree's HEAD against the default branch, via
/// git2.
pub fn diff_against_base(worktree: &Path, base_branch: &str) -> Result<String> {
    let repo = git2::Repository::open(worktree).context("Failed to open worktree repository")?;
    let base = repo
        .revparse_single(base_branch)
        .with_context(|| format!("Failed to resolve base branch {}", base_branch))?
        .peel_to_commit()
        .context("Base is not a commit")?;
    let head = repo
        .head()
        .context("Failed to resolve HEAD")?
        .peel_to_commit()
        .context("HEAD is not a commit")?;

    let diff = repo
        .diff_tree_to_tree(Some(&base.tree()?), Some(&head.tree()?), None)
        .context("Failed to compute diff")?;
    let mut text = String::new();
    diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        let origin = line.origin();
        if matches!(origin, '+' | '-' | ' ') {
            text.push(origin);
        }
        text.push_str(&String::from_utf8_lossy(line.content()));
        true
    })
    .context("Failed to render diff")?;
    Ok(text)
}

/// Stage and commit everything; a clean tree is not an error.
pub async fn commit_all(worktree: &Path, message: &str) -> Result<()> {
    run_git(worktree, &["add", "-A"]).await?;
    let clean = try_git(worktree, &["diff", "--cached", "--quiet"]).await?;
    if !clean {
        run_git(worktree, &["commit", "-m", message]).await?;
    }
    Ok(())
}

pub async fn push_branch(worktree: &Path, branch: &str) -> Result<()> {
    run_git(worktree, &["push", "-u", "origin", branch]).await?;
    Ok(())
}

/// Outcome of one rebase attempt.
#[derive(Debug, PartialEq)]
pub enum RebaseOutcome {
    Clean,
    Conflicted { files: Vec<String> },
}

/// Fetch the base branch and rebase onto it.
pub async fn rebase_onto_base(worktree: &Path, base_branch: &str) -> Result<RebaseOutcome> {
    // The worktree's origin is the shared bare clone; fetch may be a
    // no-op there but keeps remote-backed setups fresh.
    let _ = try_git(worktree, &["fetch", "origin", base_branch]).await;
    if try_git(worktree, &["rebase", base_branch]).await? {
        Ok(RebaseOutcome::Clean)
    } else {
        Ok(RebaseOutcome::Conflicted {
            files: conflicted_files(worktree).await?,
        })
    }
}

/// Resume a conflicted rebase after resolutions were staged. A multi-
/// commit rebase may re-conflict on the next replayed commit.
pub async fn rebase_continue(worktree: &Path) -> Result<RebaseOutcome> {
    let ok = Command::new("git")
        .args(["rebase", "--continue"])
        .env("GIT_EDITOR", "true")
        .current_dir(worktree)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("Failed to run git rebase --continue")?
        .success();
    if ok {
        Ok(RebaseOutcome::Clean)
    } else {
        Ok(RebaseOutcome::Conflicted {
            files: conflicted_files(worktree).await?,
        })
    }
}

pub async fn rebase_abort(worktree: &Path) -> Result<()> {
    run_git(worktree, &["rebase", "--abort"]).await?;
    Ok(())
}

pub async fn conflicted_files(worktree: &Path) -> Result<Vec<String>> {
    let output = run_git(worktree, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(output.lines().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-b", "main"]).await.unwrap();
        run_git(dir, &["config", "user.email", "test@example.com"]).await.unwrap();
        run_git(dir, &["config", "user.name", "test"]).await.unwrap();
        std::fs::write(dir.join("README.md"), "# demo\n").unwrap();
        std::fs::write(dir.join("AGENTS.md"), "Run cargo test before committing.\n").unwrap();
        run_git(dir, &["add", "-A"]).await.unwrap();
        run_git(dir, &["commit", "-m", "init"]).await.unwrap();
    }

    async fn configure_worktree_identity(worktree: &Path) {
        run_git(worktree, &["config", "user.email", "test@example.com"]).await.unwrap();
        run_git(worktree, &["config", "user.name", "test"]).await.unwrap();
    }

    #[tokio::test]
    async fn bare_clone_and_worktree_setup() {
        let upstream = TempDir::new().unwrap();
        init_repo(upstream.path()).await;
        let clones = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();

        let url = upstream.path().to_str().unwrap().to_string();
        let bare = ensure_bare_clone(clones.path(), &url).await.unwrap();
        assert!(bare.exists());

        let worktree = create_worktree(&bare, runs.path(), "cr-42", "demo", "main")
            .await
            .unwrap();
        assert!(worktree.join("README.md").exists());
        let branch = run_git(&worktree, &["branch", "--show-current"]).await.unwrap();
        assert_eq!(branch.trim(), "ai/cr-cr-42");
    }

    #[tokio::test]
    async fn worktree_recreated_from_existing_branch_after_restart() {
        let upstream = TempDir::new().unwrap();
        init_repo(upstream.path()).await;
        let clones = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        let url = upstream.path().to_str().unwrap().to_string();
        let bare = ensure_bare_clone(clones.path(), &url).await.unwrap();

        let worktree = create_worktree(&bare, runs.path(), "cr-7", "demo", "main")
            .await
            .unwrap();
        configure_worktree_identity(&worktree).await;
        std::fs::write(worktree.join("work.txt"), "in flight").unwrap();
        commit_all(&worktree, "wip").await.unwrap();

        // Simulate worker death and a fresh setup for the same CR.
        let worktree = create_worktree(&bare, runs.path(), "cr-7", "demo", "main")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(worktree.join("work.txt")).unwrap(),
            "in flight"
        );
    }

    #[tokio::test]
    async fn conventions_prefer_agents_md() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "claude rules").unwrap();
        assert_eq!(read_conventions(dir.path()), "claude rules");
        std::fs::write(dir.path().join("AGENTS.md"), "agents rules").unwrap();
        assert_eq!(read_conventions(dir.path()), "agents rules");
    }

    #[test]
    fn tree_snapshot_skips_hidden_and_vendored() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/deep/deeper")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();

        let tree = tree_snapshot(dir.path(), 3);
        assert!(tree.contains("src/"));
        assert!(tree.contains("lib.rs"));
        assert!(!tree.contains("node_modules"));
        assert!(!tree.contains(".git"));
        // Depth 3 includes deep/ and deeper/ but not their contents.
        assert!(tree.contains("deeper/"));
    }

    #[tokio::test]
    async fn diff_against_base_shows_branch_changes() {
        let upstream = TempDir::new().unwrap();
        init_repo(upstream.path()).await;
        let clones = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        let url = upstream.path().to_str().unwrap().to_string();
        let bare = ensure_bare_clone(clones.path(), &url).await.unwrap();
        let worktree = create_worktree(&bare, runs.path(), "cr-9", "demo", "main")
            .await
            .unwrap();
        configure_worktree_identity(&worktree).await;

        std::fs::write(worktree.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        commit_all(&worktree, "add manifest").await.unwrap();

        let diff = diff_against_base(&worktree, "main").unwrap();
        assert!(diff.contains("Cargo.toml"));
        assert!(diff.contains("+[package]"));
    }

    #[tokio::test]
    async fn rebase_reports_conflicts_and_aborts() {
        let upstream = TempDir::new().unwrap();
        init_repo(upstream.path()).await;
        let clones = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        let url = upstream.path().to_str().unwrap().to_string();
        let bare = ensure_bare_clone(clones.path(), &url).await.unwrap();
        let worktree = create_worktree(&bare, runs.path(), "cr-11", "demo", "main")
            .await
            .unwrap();
        configure_worktree_identity(&worktree).await;

        // Branch edits README one way...
        std::fs::write(worktree.join("README.md"), "# branch version\n").unwrap();
        commit_all(&worktree, "branch edit").await.unwrap();

        // ...while main moves the same line the other way.
        std::fs::write(upstream.path().join("README.md"), "# upstream version\n").unwrap();
        run_git(upstream.path(), &["add", "-A"]).await.unwrap();
        run_git(upstream.path(), &["commit", "-m", "upstream edit"]).await.unwrap();
        ensure_bare_clone(clones.path(), &url).await.unwrap();

        let outcome = rebase_onto_base(&worktree, "main").await.unwrap();
        match outcome {
            RebaseOutcome::Conflicted { files } => {
                assert_eq!(files, vec!["README.md".to_string()]);
            }
            RebaseOutcome::Clean => panic!("expected a conflict"),
        }
        rebase_abort(&worktree).await.unwrap();
    }

    #[tokio::test]
    async fn rebase_clean_when_no_overlap() {
        let upstream = TempDir::new().unwrap();
        init_repo(upstream.path()).await;
        let clones = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        let url = upstream.path().to_str().unwrap().to_string();
        let bare = ensure_bare_clone(clones.path(), &url).await.unwrap();
        let worktree = create_worktree(&bare, runs.path(), "cr-12", "demo", "main")
            .await
            .unwrap();
        configure_worktree_identity(&worktree).await;

        std::fs::write(worktree.join("feature.txt"), "new file\n").unwrap();
        commit_all(&worktree, "feature").await.unwrap();

        std::fs::write(upstream.path().join("other.txt"), "upstream\n").unwrap();
        run_git(upstream.path(), &["add", "-A"]).await.unwrap();
        run_git(upstream.path(), &["commit", "-m", "upstream"]).await.unwrap();
        ensure_bare_clone(clones.path(), &url).await.unwrap();

        let outcome = rebase_onto_base(&worktree, "main").await.unwrap();
        assert_eq!(outcome, RebaseOutcome::Clean);
        assert!(worktree.join("other.txt").exists());
    }
}
