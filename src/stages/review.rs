//! Review: deterministic scope pre-pass, then three reviewer agents per
//! repository in parallel (security, quality, spec compliance).
//!
//! Only critical and major findings drive the pass/fail routing; the
//! spec-compliance reviewer additionally sees the other repositories'
//! spec summaries for cross-repo contract checks.

use super::{extract_json, fan_out, scope};
use crate::agent::ModelCall;
use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use crate::gitops;
use crate::prompt::{PromptBuilder, render_cr};
use gantry_common::agent::AgentError;
use gantry_common::cr::RepoContext;
use gantry_common::event::EventKind;
use gantry_common::finding::{Finding, FindingSeverity, ScopeFlag};
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;
use serde::Deserialize;

/// Cap on diff text included in reviewer prompts; the agents read the
/// worktree for anything beyond it.
const DIFF_PROMPT_CAP: usize = 60_000;

#[derive(Debug, Deserialize)]
struct FindingJson {
    severity: FindingSeverity,
    #[serde(default)]
    category: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    line: Option<u32>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReviewJson {
    #[serde(default)]
    findings: Vec<FindingJson>,
}

fn parse_findings(
    output: &str,
    repo: &str,
    reviewer: &str,
) -> Result<Vec<Finding>, PipelineError> {
    let parsed: ReviewJson = extract_json(output)
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(|| PipelineError::Agent {
            stage: Stage::Review.as_str().to_string(),
            source: AgentError::Parse(format!("{} reviewer output for {} is not a findings list", reviewer, repo)),
        })?;
    Ok(parsed
        .findings
        .into_iter()
        .map(|f| Finding {
            severity: f.severity,
            category: f.category,
            repo: repo.to_string(),
            file: f.file,
            line: f.line,
            message: f.message,
            reviewer: reviewer.to_string(),
        })
        .collect())
}

struct RepoReview {
    findings: Vec<Finding>,
    flags: Vec<ScopeFlag>,
    calls: Vec<ModelCall>,
}

async fn run_reviewer(
    ctx: &StageContext,
    snapshot: &PipelineState,
    repo: &RepoContext,
    role: &str,
    cr_text: &str,
    diff: &str,
    flags: &[ScopeFlag],
    extra_section: Option<(&str, &str)>,
) -> Result<(Vec<Finding>, Vec<ModelCall>), PipelineError> {
    let stage = Stage::Review.as_str();
    let flag_notes = flags
        .iter()
        .map(|f| format!("[{}] {}", f.kind.as_str(), f.file))
        .collect::<Vec<_>>()
        .join("\n");

    let mut builder = PromptBuilder::new(snapshot.config.repo_context_token_cap)
        .repo_context(repo)
        .task("Change request", cr_text)
        .task("Diff under review", &truncate(diff, DIFF_PROMPT_CAP))
        .task("Scope warnings from the deterministic pre-pass", &flag_notes);
    if let Some((title, body)) = extra_section {
        builder = builder.task(title, body);
    }

    let mut task = ctx.build_task(role, stage, snapshot, Some(repo));
    task.user_prompt = builder.intervention(snapshot.intervention.as_deref()).build();
    let result = ctx.invoke_agent(stage, Some(&repo.repo_name), task).await?;
    let findings = parse_findings(&result.output, &repo.repo_name, role_short(role))?;
    Ok((findings, result.calls))
}

fn role_short(role: &str) -> &str {
    role.strip_suffix("_reviewer").unwrap_or(role)
}

fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        let head: String = text.chars().take(cap).collect();
        format!("{}\n[... diff truncated]", head)
    }
}

pub async fn run(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let stage = Stage::Review.as_str();
    let cr_text = render_cr(&state.cr_or_raw());

    let results = fan_out(&state, |repo, snapshot| {
        let ctx = ctx.clone();
        let cr_text = cr_text.clone();
        async move {
            let diff = match repo.worktree_path.as_deref() {
                Some(worktree) => match gitops::diff_against_base(worktree, &repo.default_branch) {
                    Ok(diff) => diff,
                    Err(e) => {
                        tracing::warn!(repo = %repo.repo_name, error = %format!("{:#}", e), "diff extraction failed");
                        String::new()
                    }
                },
                None => String::new(),
            };
            let flags = scope::scan(&repo.repo_name, &diff);

            // Spec summaries of the *other* repositories, for contract checks.
            let other_specs = snapshot
                .behaviour
                .specs
                .iter()
                .filter(|(name, _)| *name != &repo.repo_name)
                .map(|(name, meta)| format!("## {}\n{}", name, meta.summary))
                .collect::<Vec<_>>()
                .join("\n\n");

            let (security, quality, compliance) = tokio::join!(
                run_reviewer(&ctx, &snapshot, &repo, "security_reviewer", &cr_text, &diff, &flags, None),
                run_reviewer(&ctx, &snapshot, &repo, "quality_reviewer", &cr_text, &diff, &flags, None),
                run_reviewer(
                    &ctx,
                    &snapshot,
                    &repo,
                    "spec_compliance_reviewer",
                    &cr_text,
                    &diff,
                    &flags,
                    Some(("Other repositories' spec summaries", other_specs.as_str())),
                ),
            );

            let mut findings = Vec::new();
            let mut calls = Vec::new();
            for result in [security, quality, compliance] {
                let (f, c) = result?;
                findings.extend(f);
                calls.extend(c);
            }
            Ok((repo.repo_name.clone(), RepoReview { findings, flags, calls }))
        }
    })
    .await?;

    let mut findings = Vec::new();
    let mut flags = Vec::new();
    for (_, review) in results {
        ctx.record_cost(stage, &mut state, &review.calls)?;
        findings.extend(review.findings);
        flags.extend(review.flags);
    }

    for finding in &findings {
        ctx.emit(stage, EventKind::ReviewFinding { finding: finding.clone() })?;
    }

    state.review.findings = findings;
    state.review.scope_flags = flags;
    let blocking = state.review.has_blocking_findings();
    state.review.passed = Some(!blocking);
    if blocking {
        state.review.review_loops += 1;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::context::test_support::scripted_context;
    use gantry_common::snapshot::ConfigSnapshot;

    fn clean_review() -> serde_json::Value {
        serde_json::json!({"findings": []})
    }

    fn state_with_repo() -> PipelineState {
        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        state.repos.push(RepoContext::new("https://h/api.git", "main"));
        state
    }

    #[tokio::test]
    async fn clean_reviews_pass() {
        let (ctx, backend) = scripted_context();
        backend.push_json("security_reviewer", clean_review());
        backend.push_json("quality_reviewer", clean_review());
        backend.push_json("spec_compliance_reviewer", clean_review());

        let state = super::run(&ctx, state_with_repo()).await.unwrap();
        assert!(state.review.review_passed());
        assert_eq!(state.review.review_loops, 0);
        assert!(state.review.findings.is_empty());
    }

    #[tokio::test]
    async fn blocking_finding_fails_review_and_counts_a_loop() {
        let (ctx, backend) = scripted_context();
        backend.push_json(
            "security_reviewer",
            serde_json::json!({"findings": [{
                "severity": "critical",
                "category": "injection",
                "file": "src/db.rs",
                "line": 40,
                "message": "string-built SQL"
            }]}),
        );
        backend.push_json("quality_reviewer", clean_review());
        backend.push_json("spec_compliance_reviewer", clean_review());

        let state = super::run(&ctx, state_with_repo()).await.unwrap();
        assert!(!state.review.review_passed());
        assert_eq!(state.review.review_loops, 1);
        let finding = &state.review.findings[0];
        assert_eq!(finding.reviewer, "security");
        assert_eq!(finding.repo, "api");
        assert_eq!(finding.line, Some(40));

        let events = ctx.bus.read_since(&ctx.cr_id, 0).unwrap();
        assert!(events.iter().any(|e| matches!(e.kind, EventKind::ReviewFinding { .. })));
    }

    #[tokio::test]
    async fn minor_findings_do_not_fail_review() {
        let (ctx, backend) = scripted_context();
        backend.push_json(
            "quality_reviewer",
            serde_json::json!({"findings": [{
                "severity": "minor",
                "category": "style",
                "file": "src/lib.rs",
                "line": null,
                "message": "prefer iterators"
            }]}),
        );
        backend.push_json("security_reviewer", clean_review());
        backend.push_json("spec_compliance_reviewer", clean_review());

        let state = super::run(&ctx, state_with_repo()).await.unwrap();
        assert!(state.review.review_passed());
        assert_eq!(state.review.findings.len(), 1);
    }

    #[tokio::test]
    async fn findings_are_replaced_on_reentry_not_accumulated() {
        let (ctx, backend) = scripted_context();
        backend.push_json("security_reviewer", clean_review());
        backend.push_json("quality_reviewer", clean_review());
        backend.push_json("spec_compliance_reviewer", clean_review());

        let mut state = state_with_repo();
        state.review.review_loops = 1;
        state
            .review
            .findings
            .push(Finding::new(FindingSeverity::Critical, "api", "old.rs", "stale"));

        let state = super::run(&ctx, state).await.unwrap();
        assert!(state.review.findings.is_empty());
        assert!(state.review.review_passed());
        assert_eq!(state.review.review_loops, 1, "clean pass adds no loop");
    }

    #[test]
    fn parse_findings_maps_reviewer_and_repo() {
        let output = r#"{"findings": [{"severity": "major", "message": "no auth"}]}"#;
        let findings = parse_findings(output, "api", "security").unwrap();
        assert_eq!(findings[0].repo, "api");
        assert_eq!(findings[0].reviewer, "security");
        assert!(findings[0].severity.is_blocking());
    }

    #[test]
    fn unparseable_review_is_an_error() {
        assert!(parse_findings("LGTM!", "api", "quality").is_err());
    }
}
