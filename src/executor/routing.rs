//! Pure routing: `(current node, state) → next node or terminal`.
//!
//! Node bodies never decide where to go next; they only update state.
//! Resume overrides are applied to the state *before* routing, and the
//! executor routes from the override's anchor stage — the latest in
//! pipeline order — instead of the checkpointed node.

use gantry_common::run::PauseReason;
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;

/// Where the executor goes after a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Stage(Stage),
    Paused(PauseReason),
    Done,
}

/// The routing function. Pure: no side effects, no I/O.
pub fn route(current: Stage, state: &PipelineState) -> Next {
    let config = &state.config;
    match current {
        Stage::Intake => Next::Stage(Stage::RepoIdentification),
        Stage::RepoIdentification => {
            if state.repos.is_empty() {
                Next::Paused(PauseReason::NoRepos)
            } else {
                Next::Stage(Stage::WorktreeSetup)
            }
        }
        Stage::WorktreeSetup => Next::Stage(Stage::BehaviourTranslation),
        Stage::BehaviourTranslation => Next::Stage(Stage::BehaviourVerification),
        Stage::BehaviourVerification => {
            if state.behaviour.verified {
                Next::Stage(Stage::Tdd)
            } else if state.behaviour.verification_loops < config.max_verification_loops {
                Next::Stage(Stage::BehaviourTranslation)
            } else {
                Next::Paused(PauseReason::VerificationLoopLimit)
            }
        }
        Stage::Tdd => Next::Stage(Stage::Review),
        Stage::Review => {
            if state.review.review_passed() {
                Next::Stage(Stage::Rebase)
            } else if state.review.review_loops < config.max_review_loops {
                Next::Stage(Stage::Tdd)
            } else {
                Next::Paused(PauseReason::ReviewLoopLimit)
            }
        }
        Stage::Rebase => {
            if state.rebase.is_clean() {
                Next::Stage(Stage::Delivery)
            } else {
                Next::Paused(PauseReason::RebaseConflict)
            }
        }
        Stage::Delivery => {
            if state.delivery.awaiting_ci {
                Next::Paused(PauseReason::WaitingCi)
            } else if state.delivery.ci_passed == Some(false) {
                // ci_loops was bumped when the failure signal was applied.
                if state.development.ci_loops < config.max_ci_loops {
                    Next::Stage(Stage::Tdd)
                } else {
                    Next::Paused(PauseReason::CiLoopLimit)
                }
            } else {
                Next::Stage(Stage::ReleaseGate)
            }
        }
        Stage::ReleaseGate => {
            if state.release.awaiting_approval {
                Next::Paused(PauseReason::WaitingApproval)
            } else if state.release.approved == Some(false) {
                Next::Paused(PauseReason::OperatorRequest)
            } else {
                Next::Stage(Stage::Release)
            }
        }
        Stage::Release => Next::Stage(Stage::Retrospective),
        Stage::Retrospective => Next::Done,
    }
}
