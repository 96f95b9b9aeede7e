//! Review findings and deterministic scope flags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of an individual review finding.
///
/// Ordered from most to least severe. Only `critical` and `major`
/// participate in the review routing decision.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Critical,
    Major,
    #[default]
    Minor,
    Info,
}

impl FindingSeverity {
    /// Whether this severity blocks progression to rebase.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::Major)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Info => "info",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "critical" => Ok(Self::Critical),
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "info" => Ok(Self::Info),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single issue raised by a reviewer agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub category: String,
    pub repo: String,
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
    /// Which reviewer raised it (security, quality, spec_compliance).
    pub reviewer: String,
}

impl Finding {
    pub fn new(
        severity: FindingSeverity,
        repo: impl Into<String>,
        file: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: String::new(),
            repo: repo.into(),
            file: file.into(),
            line: None,
            message: message.into(),
            reviewer: String::new(),
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = reviewer.into();
        self
    }
}

/// What the deterministic diff pre-pass flagged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeFlagKind {
    /// Docker, Kubernetes, CI, or Terraform configuration paths.
    ConfigFile,
    /// package.json, requirements.txt, Cargo.toml, go.mod and friends.
    DependencyManifest,
    /// Deploy descriptors and infrastructure definitions.
    Infrastructure,
}

impl ScopeFlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigFile => "config_file",
            Self::DependencyManifest => "dependency_manifest",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// A warning emitted before reviewer agents run: the diff touches a path
/// class that widens the change's blast radius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeFlag {
    pub kind: ScopeFlagKind,
    pub repo: String,
    pub file: String,
}
