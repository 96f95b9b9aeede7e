//! Out-of-band operator commands.
//!
//! Two distinct mechanisms share the registry: free-text interventions
//! observed between nodes while the CR runs, and structured resume
//! overrides consumed at worker startup while the CR is paused.
//! Interventions never change routing; overrides never outlive one resume.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};

/// Registry slot kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// Free-text guidance merged into the next agent prompts.
    Instructions,
    /// Guidance targeted at one agent role, delivered between tool rounds.
    Nudge,
    /// Structured state patch applied before resume routing.
    ResumeOverrides,
}

impl InterventionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instructions => "instructions",
            Self::Nudge => "nudge",
            Self::ResumeOverrides => "resume_overrides",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "instructions" => Ok(Self::Instructions),
            "nudge" => Ok(Self::Nudge),
            "resume_overrides" => Ok(Self::ResumeOverrides),
            _ => Err(format!("Invalid intervention kind: {}", s)),
        }
    }
}

/// State patches attached to a resume request.
///
/// Each field rewrites the gate it names; the resume anchor is the latest
/// stage in pipeline order among the set fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResumeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebase_clean: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
}

impl ResumeOverrides {
    pub fn is_empty(&self) -> bool {
        self.verified.is_none()
            && self.review_passed.is_none()
            && self.rebase_clean.is_none()
            && self.ci_passed.is_none()
            && self.approved.is_none()
    }

    /// The stage each override gates, latest in pipeline order wins.
    pub fn anchor_stage(&self) -> Option<Stage> {
        let mut anchor: Option<Stage> = None;
        let mut consider = |set: bool, stage: Stage| {
            if set {
                anchor = Some(match anchor {
                    Some(current) if current.order_index() >= stage.order_index() => current,
                    _ => stage,
                });
            }
        };
        consider(self.verified.is_some(), Stage::BehaviourVerification);
        consider(self.review_passed.is_some(), Stage::Review);
        consider(self.rebase_clean.is_some(), Stage::Rebase);
        consider(self.ci_passed.is_some(), Stage::Delivery);
        consider(self.approved.is_some(), Stage::ReleaseGate);
        anchor
    }
}
