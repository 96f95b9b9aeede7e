//! Release gate, release, and retrospective.
//!
//! The gate auto-approves unless the run's config demands an approval
//! signal, in which case it arms the checkpoint-and-terminate pause.
//! Release renders the PR description from the pipeline state and
//! executes the configured release action; the retrospective is
//! non-blocking.

use crate::errors::PipelineError;
use crate::executor::{append_run_log, context::StageContext};
use gantry_common::cr::DeliveryStrategy;
use gantry_common::state::PipelineState;
use std::process::Stdio;

pub async fn gate(
    _ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    if state.release.approved.is_some() {
        // An approval signal (or override) already decided.
        state.release.awaiting_approval = false;
    } else if state.config.require_approval {
        state.release.awaiting_approval = true;
    } else {
        state.release.approved = Some(true);
        state.release.awaiting_approval = false;
    }
    Ok(state)
}

/// PR description assembled from the pipeline state.
pub fn render_pr_description(state: &PipelineState) -> String {
    let cr = state.cr_or_raw();
    let mut out = format!("## {}\n\n{}\n", cr.title, cr.description);

    if !cr.acceptance_criteria.is_empty() {
        out.push_str("\n### Acceptance criteria\n");
        for criterion in &cr.acceptance_criteria {
            out.push_str(&format!("- {}\n", criterion));
        }
    }

    let spec_files: Vec<&String> = state
        .behaviour
        .specs
        .values()
        .flat_map(|meta| &meta.feature_files)
        .collect();
    if !spec_files.is_empty() {
        out.push_str("\n### Behaviour specs\n");
        for file in spec_files {
            out.push_str(&format!("- {}\n", file));
        }
    }

    if !state.development.test_results.is_empty() {
        out.push_str("\n### Test results\n");
        for (repo, result) in &state.development.test_results {
            out.push_str(&format!(
                "- {}: {}\n",
                repo,
                if result.passed { "passing" } else { "failing" }
            ));
        }
    }

    if !state.review.findings.is_empty() {
        out.push_str("\n### Review findings\n");
        for finding in &state.review.findings {
            out.push_str(&format!(
                "- [{}] {} {}: {}\n",
                finding.severity, finding.repo, finding.file, finding.message
            ));
        }
    }

    let changed: Vec<&String> = state
        .development
        .generated_files
        .values()
        .flatten()
        .collect();
    if !changed.is_empty() {
        out.push_str("\n### Changed files\n");
        for file in changed {
            out.push_str(&format!("- {}\n", file));
        }
    }

    out.push_str(&format!(
        "\n### Pipeline\n- verification loops: {}\n- review loops: {}\n- ci loops: {}\n- cost: ${:.2} ({} in / {} out tokens)\n",
        state.behaviour.verification_loops,
        state.review.review_loops,
        state.development.ci_loops,
        state.cost.usd,
        state.cost.input_tokens,
        state.cost.output_tokens,
    ));
    out
}

pub async fn run(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let description = render_pr_description(&state);
    let branch = crate::gitops::branch_name(&ctx.cr_id);
    let title = state.cr_or_raw().title;

    let mut results = Vec::new();
    for repo in &state.repos {
        let message = match repo.delivery {
            DeliveryStrategy::SelfContained => "verified in-process; no PR".to_string(),
            DeliveryStrategy::PushAndForget | DeliveryStrategy::PushAndWait => {
                match repo.worktree_path.as_deref() {
                    Some(worktree) => {
                        match create_pull_request(worktree, &title, &description).await {
                            Ok(url) => {
                                if let Some(push) =
                                    state.delivery.push_results.get_mut(&repo.repo_name)
                                {
                                    push.pr_url = Some(url.clone());
                                }
                                format!("PR opened: {}", url)
                            }
                            // PR creation is best-effort; the branch is
                            // already pushed.
                            Err(e) => format!("branch {} pushed; PR not opened ({:#})", branch, e),
                        }
                    }
                    None => format!("branch {} pushed; no worktree for PR", branch),
                }
            }
        };
        results.push((repo.repo_name.clone(), message));
    }
    for (repo_name, message) in results {
        state.release.results.insert(repo_name, message);
    }
    Ok(state)
}

/// Open a PR with the `gh` CLI. Overridable for tests via
/// `GANTRY_GH_CMD`.
async fn create_pull_request(
    worktree: &std::path::Path,
    title: &str,
    body: &str,
) -> anyhow::Result<String> {
    let gh = std::env::var("GANTRY_GH_CMD").unwrap_or_else(|_| "gh".to_string());
    let output = tokio::process::Command::new(&gh)
        .args(["pr", "create", "--title", title, "--body", body])
        .current_dir(worktree)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "gh pr create failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Log a run summary. Non-blocking: failures are swallowed and the CR
/// outcome is unchanged.
pub async fn retrospective(
    ctx: &StageContext,
    state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let summary = format!(
        "run {} finished: {} repo(s), {} verification loop(s), {} review loop(s), {} ci loop(s), ${:.4} spent",
        ctx.cr_id,
        state.repos.len(),
        state.behaviour.verification_loops,
        state.review.review_loops,
        state.development.ci_loops,
        state.cost.usd,
    );
    tracing::info!(cr_id = %ctx.cr_id, "{}", summary);
    if let Err(e) = append_run_log(&ctx.runs_dir, &ctx.cr_id, &summary) {
        tracing::warn!(cr_id = %ctx.cr_id, error = %format!("{:#}", e), "retrospective log write failed");
    }
    Ok(state)
}
