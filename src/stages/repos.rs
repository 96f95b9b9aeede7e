//! Repo identification: validate and normalise the repositories named by
//! the trigger payload.
//!
//! The contexts themselves are built at trigger time; this node
//! deduplicates them and leaves an empty list for routing to pause on.

use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use gantry_common::state::PipelineState;
use std::collections::BTreeSet;

pub async fn run(
    _ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let mut seen = BTreeSet::new();
    state.repos.retain(|repo| seen.insert(repo.repo_name.clone()));
    if state.repos.is_empty() {
        tracing::warn!("no repositories specified; run will pause");
    }
    Ok(state)
}
