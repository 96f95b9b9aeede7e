//! CR run lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a CR run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }

    /// Terminal statuses have no active worker and accept no transitions
    /// except retention cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a run entered `paused`.
///
/// Pauses are expected operational behaviour; the human decides the next
/// transition from here. `waiting_ci` and `waiting_approval` are
/// checkpoint-and-terminate pauses and count against no loop limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    VerificationLoopLimit,
    ReviewLoopLimit,
    TddLoopLimit,
    CiLoopLimit,
    RebaseConflict,
    WaitingCi,
    WaitingApproval,
    CostLimit,
    StageTimeout,
    NodeError,
    OperatorRequest,
    NoRepos,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerificationLoopLimit => "verification_loop_limit",
            Self::ReviewLoopLimit => "review_loop_limit",
            Self::TddLoopLimit => "tdd_loop_limit",
            Self::CiLoopLimit => "ci_loop_limit",
            Self::RebaseConflict => "rebase_conflict",
            Self::WaitingCi => "waiting_ci",
            Self::WaitingApproval => "waiting_approval",
            Self::CostLimit => "cost_limit",
            Self::StageTimeout => "stage_timeout",
            Self::NodeError => "node_error",
            Self::OperatorRequest => "operator_request",
            Self::NoRepos => "no_repos",
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One persisted run record per change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrRun {
    pub cr_id: String,
    pub external_id: Option<String>,
    pub source: String,
    pub title: String,
    pub status: RunStatus,
    pub current_stage: String,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub pause_reason: Option<PauseReason>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert!(RunStatus::from_str("queued").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn pause_reason_serializes_snake_case() {
        let json = serde_json::to_string(&PauseReason::WaitingCi).unwrap();
        assert_eq!(json, "\"waiting_ci\"");
    }
}
