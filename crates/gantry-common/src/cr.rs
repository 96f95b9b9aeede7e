//! Change-request payload and per-repository context.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Priority assigned to a change request during intake.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// The structured form of a change request produced by intake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredCr {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub affected_domains: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub risk_flags: Vec<String>,
}

impl StructuredCr {
    /// Fallback used when the intake agent's output cannot be parsed: the
    /// run continues on raw title and description alone.
    pub fn from_raw(title: &str, description: &str) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }
}

/// How delivery hands the finished branches off.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// Run verification in-process and finish.
    #[default]
    SelfContained,
    /// Push branches, open PRs, checkpoint and wait for CI signal.
    PushAndWait,
    /// Push branches and return without waiting.
    PushAndForget,
}

impl DeliveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfContained => "self_contained",
            Self::PushAndWait => "push_and_wait",
            Self::PushAndForget => "push_and_forget",
        }
    }
}

/// Per-repository working context, built up by repo identification and
/// worktree setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoContext {
    pub repo_url: String,
    pub repo_name: String,
    pub default_branch: String,
    /// Set by worktree setup; None until then.
    pub worktree_path: Option<PathBuf>,
    /// Contents of AGENTS.md (or CLAUDE.md fallback), empty when neither exists.
    #[serde(default)]
    pub conventions: String,
    /// Depth-limited directory tree captured at worktree setup.
    #[serde(default)]
    pub tree_snapshot: String,
    pub language: Option<String>,
    pub test_command: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryStrategy,
}

impl RepoContext {
    pub fn new(repo_url: &str, default_branch: &str) -> Self {
        Self {
            repo_url: repo_url.to_string(),
            repo_name: repo_name_from_url(repo_url),
            default_branch: default_branch.to_string(),
            worktree_path: None,
            conventions: String::new(),
            tree_snapshot: String::new(),
            language: None,
            test_command: None,
            delivery: DeliveryStrategy::default(),
        }
    }
}

/// One repository entry in a trigger payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRequest {
    pub repo_url: String,
    pub default_branch: Option<String>,
    pub test_command: Option<String>,
    pub language: Option<String>,
    pub delivery: Option<DeliveryStrategy>,
}

/// The normalised CR trigger payload (REST: POST /api/pipeline/trigger).
///
/// Single-repo requests use the flat `repo_url` fields; multi-repo
/// requests use `repos`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub source: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub repo_default_branch: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub repos: Vec<RepoRequest>,
    #[serde(default)]
    pub delivery: Option<DeliveryStrategy>,
}

impl TriggerRequest {
    /// Repo contexts named by the payload; `repos` wins over the flat
    /// single-repo fields.
    pub fn repo_contexts(&self) -> Vec<RepoContext> {
        let entries: Vec<RepoRequest> = if !self.repos.is_empty() {
            self.repos.clone()
        } else if let Some(url) = &self.repo_url {
            vec![RepoRequest {
                repo_url: url.clone(),
                default_branch: self.repo_default_branch.clone(),
                test_command: self.test_command.clone(),
                language: self.language.clone(),
                delivery: self.delivery,
            }]
        } else {
            Vec::new()
        };

        entries
            .into_iter()
            .map(|entry| {
                let mut repo = RepoContext::new(
                    &entry.repo_url,
                    entry.default_branch.as_deref().unwrap_or("main"),
                );
                repo.test_command = entry.test_command;
                repo.language = entry.language;
                repo.delivery = entry.delivery.unwrap_or_default();
                repo
            })
            .collect()
    }

    /// Raw description for the pipeline state, with payload-provided
    /// acceptance criteria folded in for the intake agent.
    pub fn raw_description(&self) -> String {
        if self.acceptance_criteria.is_empty() {
            return self.description.clone();
        }
        let mut out = self.description.clone();
        out.push_str("\n\nAcceptance criteria:\n");
        for criterion in &self.acceptance_criteria {
            out.push_str(&format!("- {}\n", criterion));
        }
        out
    }
}

/// Derive a directory-safe repository name from its URL.
pub fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let name = trimmed
        .rsplit(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repo");
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
