//! Intake: parse the raw CR into its structured form.
//!
//! Unparseable agent output falls back to a default `StructuredCr`
//! populated from the raw title and description — the run continues.

use super::extract_json;
use crate::errors::PipelineError;
use crate::executor::context::StageContext;
use crate::prompt::PromptBuilder;
use gantry_common::cr::StructuredCr;
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;

pub async fn run(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState, PipelineError> {
    let stage = Stage::Intake.as_str();
    let mut task = ctx.build_task("intake", stage, &state, None);
    // Intake has nothing to explore; keep it a single structured call.
    task.explore_model.clear();
    task.plan_model.clear();
    task.allowed_tools.clear();
    task.user_prompt = PromptBuilder::new(state.config.repo_context_token_cap)
        .task(
            "Change request",
            &format!("{}\n\n{}", state.raw_title, state.raw_description),
        )
        .intervention(state.intervention.as_deref())
        .build();

    let result = ctx.invoke_agent(stage, None, task).await?;
    ctx.record_cost(stage, &mut state, &result.calls)?;

    let cr = extract_json(&result.output)
        .and_then(|value| serde_json::from_value::<StructuredCr>(value).ok())
        .map(|mut cr| {
            if cr.title.is_empty() {
                cr.title = state.raw_title.clone();
            }
            cr
        })
        .unwrap_or_else(|| {
            tracing::warn!(cr_id = %ctx.cr_id, "intake output unparseable; using raw fallback");
            StructuredCr::from_raw(&state.raw_title, &state.raw_description)
        });

    state.cr = Some(cr);
    Ok(state)
}
