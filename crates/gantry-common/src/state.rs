//! The working payload checkpointed after each node.
//!
//! The executor owns the in-memory state exclusively. Fan-out sub-tasks
//! receive an immutable snapshot and return per-repo deltas; the executor
//! merges them into the maps here at fan-in. Per-repo maps are keyed by
//! `RepoContext::repo_name`.

use crate::cr::{RepoContext, StructuredCr};
use crate::finding::{Finding, ScopeFlag};
use crate::intervention::ResumeOverrides;
use crate::snapshot::ConfigSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spec metadata produced by behaviour translation for one repo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecMeta {
    /// Paths of the committed `.feature` files, relative to the worktree.
    pub feature_files: Vec<String>,
    /// Short summary used for cross-repo contract checks.
    pub summary: String,
}

/// Verifier agent verdict for one repo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub verified: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub missing_scenarios: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviourState {
    pub specs: BTreeMap<String, SpecMeta>,
    pub verdicts: BTreeMap<String, VerificationVerdict>,
    /// Composite verdict: all repos verified and the consistency check passed.
    pub verified: bool,
    pub consistency_passed: Option<bool>,
    pub verification_loops: u32,
}

impl BehaviourState {
    /// Feedback carried back into translation on a verification loop.
    pub fn loop_feedback(&self) -> String {
        let mut parts = Vec::new();
        for (repo, verdict) in &self.verdicts {
            if !verdict.verified && !verdict.feedback.is_empty() {
                parts.push(format!("{}: {}", repo, verdict.feedback));
            }
        }
        parts.join("\n")
    }
}

/// Result of one test-suite run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRunResult {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevelopmentState {
    pub generated_files: BTreeMap<String, Vec<String>>,
    pub test_results: BTreeMap<String, TestRunResult>,
    pub tdd_iterations: BTreeMap<String, u32>,
    /// Tracked separately from `ReviewState::review_loops`; CI failures
    /// route back to TDD on their own counter.
    pub ci_loops: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewState {
    pub findings: Vec<Finding>,
    pub scope_flags: Vec<ScopeFlag>,
    pub review_loops: u32,
    /// Set by the review stage from the findings, or rewritten by a resume
    /// override.
    pub passed: Option<bool>,
}

impl ReviewState {
    pub fn has_blocking_findings(&self) -> bool {
        self.findings.iter().any(|f| f.severity.is_blocking())
    }

    /// Routing consults this: an explicit verdict wins, otherwise the
    /// findings decide.
    pub fn review_passed(&self) -> bool {
        self.passed.unwrap_or_else(|| !self.has_blocking_findings())
    }

    /// Findings summary carried back into TDD on a review loop.
    pub fn loop_feedback(&self) -> String {
        self.findings
            .iter()
            .filter(|f| f.severity.is_blocking())
            .map(|f| {
                format!(
                    "[{}] {} {}: {}",
                    f.severity,
                    f.repo,
                    match f.line {
                        Some(line) => format!("{}:{}", f.file, line),
                        None => f.file.clone(),
                    },
                    f.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebaseState {
    /// Tri-state: absent defaults to clean.
    pub rebase_clean: Option<bool>,
    /// repo → conflict context for the operator.
    pub conflicts: BTreeMap<String, String>,
}

impl RebaseState {
    pub fn is_clean(&self) -> bool {
        self.rebase_clean.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResult {
    pub branch: String,
    pub pushed: bool,
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryState {
    pub push_results: BTreeMap<String, PushResult>,
    pub verification: BTreeMap<String, bool>,
    pub all_verified: bool,
    /// Set when a push_and_wait delivery checkpointed and terminated.
    pub awaiting_ci: bool,
    /// Reported back by the CI signal on resume.
    pub ci_passed: Option<bool>,
    /// CI logs attached to the failure signal, carried as loop context.
    #[serde(default)]
    pub ci_logs: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseState {
    pub approved: Option<bool>,
    pub awaiting_approval: bool,
    pub results: BTreeMap<String, String>,
}

/// Per-model token/cost aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
}

/// Accumulated cost, keyed by model and aggregated. `usd` is
/// non-decreasing within a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostLedger {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

impl CostLedger {
    pub fn record(&mut self, model_id: &str, input_tokens: u64, output_tokens: u64, usd: f64) {
        debug_assert!(usd >= 0.0);
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.usd += usd;
        let entry = self.by_model.entry(model_id.to_string()).or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.usd += usd;
    }
}

/// The full checkpointed pipeline state for one CR run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub raw_title: String,
    pub raw_description: String,
    /// Structured CR, set by intake.
    pub cr: Option<StructuredCr>,
    pub repos: Vec<RepoContext>,
    pub behaviour: BehaviourState,
    pub development: DevelopmentState,
    pub review: ReviewState,
    pub rebase: RebaseState,
    pub delivery: DeliveryState,
    pub release: ReleaseState,
    pub cost: CostLedger,
    /// Read-only for the lifetime of the run.
    pub config: ConfigSnapshot,
    /// Most recently consumed operator instruction, merged into subsequent
    /// agent prompts.
    pub intervention: Option<String>,
}

impl PipelineState {
    pub fn new(raw_title: &str, raw_description: &str, config: ConfigSnapshot) -> Self {
        Self {
            raw_title: raw_title.to_string(),
            raw_description: raw_description.to_string(),
            cr: None,
            repos: Vec::new(),
            behaviour: BehaviourState::default(),
            development: DevelopmentState::default(),
            review: ReviewState::default(),
            rebase: RebaseState::default(),
            delivery: DeliveryState::default(),
            release: ReleaseState::default(),
            cost: CostLedger::default(),
            config,
            intervention: None,
        }
    }

    /// The structured CR, falling back to the raw fields when intake has
    /// not run (or could not parse).
    pub fn cr_or_raw(&self) -> StructuredCr {
        self.cr
            .clone()
            .unwrap_or_else(|| StructuredCr::from_raw(&self.raw_title, &self.raw_description))
    }

    pub fn repo(&self, repo_name: &str) -> Option<&RepoContext> {
        self.repos.iter().find(|r| r.repo_name == repo_name)
    }

    /// Merge a consumed intervention into the slot.
    pub fn absorb_intervention(&mut self, text: &str) {
        match &mut self.intervention {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => self.intervention = Some(text.to_string()),
        }
    }

    /// Rewrite gate fields named by resume overrides. Applied before
    /// routing at worker startup; never persisted beyond the patched state.
    pub fn apply_overrides(&mut self, overrides: &ResumeOverrides) {
        if let Some(verified) = overrides.verified {
            self.behaviour.verified = verified;
            if verified {
                self.behaviour.consistency_passed = Some(true);
            }
        }
        if let Some(passed) = overrides.review_passed {
            self.review.passed = Some(passed);
        }
        if let Some(clean) = overrides.rebase_clean {
            self.rebase.rebase_clean = Some(clean);
            if clean {
                self.rebase.conflicts.clear();
            }
        }
        if let Some(ci_passed) = overrides.ci_passed {
            self.delivery.ci_passed = Some(ci_passed);
            self.delivery.awaiting_ci = false;
            if !ci_passed {
                // A CI failure signal counts one dev↔CI loop, separate
                // from the review counter.
                self.development.ci_loops += 1;
            }
        }
        if let Some(approved) = overrides.approved {
            self.release.approved = Some(approved);
            self.release.awaiting_approval = false;
        }
    }
}
