//! Shared domain types for the Gantry pipeline core.
//!
//! Everything the store, event bus, executor, stages, and API agree on
//! lives here: run lifecycle, stage graph vertices, the checkpointed
//! pipeline state, the event vocabulary, interventions and resume
//! overrides, and the agent backend interface.

pub mod agent;
pub mod cr;
pub mod event;
pub mod finding;
pub mod intervention;
pub mod run;
pub mod snapshot;
pub mod stage;
pub mod state;

pub use agent::{AgentBackend, AgentError, AgentEvent, AgentOutcome, AgentTask};
pub use cr::{
    DeliveryStrategy, Priority, RepoContext, RepoRequest, StructuredCr, TriggerRequest,
    repo_name_from_url,
};
pub use event::{EventKind, PipelineEvent, stream_key};
pub use finding::{Finding, FindingSeverity, ScopeFlag, ScopeFlagKind};
pub use intervention::{InterventionKind, ResumeOverrides};
pub use run::{CrRun, PauseReason, RunStatus};
pub use snapshot::{ConfigSnapshot, ModelPrice, PriceTable, RetryPolicy};
pub use stage::{ALL_STAGES, Stage};
pub use state::{
    BehaviourState, CostLedger, DeliveryState, DevelopmentState, PipelineState, PushResult,
    RebaseState, ReleaseState, ReviewState, SpecMeta, TestRunResult, VerificationVerdict,
};
