//! The pipeline stage graph vertices.
//!
//! Stages are ordered; routing consults [`Stage::order_index`] when resume
//! overrides name more than one re-entry point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A vertex in the CR orchestration graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    RepoIdentification,
    WorktreeSetup,
    BehaviourTranslation,
    BehaviourVerification,
    Tdd,
    Review,
    Rebase,
    Delivery,
    ReleaseGate,
    Release,
    Retrospective,
}

/// All stages in pipeline order.
pub const ALL_STAGES: [Stage; 12] = [
    Stage::Intake,
    Stage::RepoIdentification,
    Stage::WorktreeSetup,
    Stage::BehaviourTranslation,
    Stage::BehaviourVerification,
    Stage::Tdd,
    Stage::Review,
    Stage::Rebase,
    Stage::Delivery,
    Stage::ReleaseGate,
    Stage::Release,
    Stage::Retrospective,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::RepoIdentification => "repo_identification",
            Self::WorktreeSetup => "worktree_setup",
            Self::BehaviourTranslation => "behaviour_translation",
            Self::BehaviourVerification => "behaviour_verification",
            Self::Tdd => "tdd",
            Self::Review => "review",
            Self::Rebase => "rebase",
            Self::Delivery => "delivery",
            Self::ReleaseGate => "release_gate",
            Self::Release => "release",
            Self::Retrospective => "retrospective",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "intake" => Ok(Self::Intake),
            "repo_identification" => Ok(Self::RepoIdentification),
            "worktree_setup" => Ok(Self::WorktreeSetup),
            "behaviour_translation" => Ok(Self::BehaviourTranslation),
            "behaviour_verification" => Ok(Self::BehaviourVerification),
            "tdd" => Ok(Self::Tdd),
            "review" => Ok(Self::Review),
            "rebase" => Ok(Self::Rebase),
            "delivery" => Ok(Self::Delivery),
            "release_gate" => Ok(Self::ReleaseGate),
            "release" => Ok(Self::Release),
            "retrospective" => Ok(Self::Retrospective),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }

    /// Position in pipeline order, 0-based.
    pub fn order_index(&self) -> usize {
        ALL_STAGES
            .iter()
            .position(|s| s == self)
            .expect("stage listed in ALL_STAGES")
    }

    /// The first stage of the graph.
    pub fn first() -> Self {
        Stage::Intake
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
