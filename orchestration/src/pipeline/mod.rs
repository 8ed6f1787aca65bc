//! Per-ticket pipeline state: stages, contexts and the context store.

pub mod context;
pub mod patch;
pub mod stage;
pub mod store;

pub use context::{
    AttemptTiming, OutcomeCounts, PipelineContext, PipelineSummary, StageExecutionRecord,
    StageOutcome,
};
pub use patch::{PatchConfig, PatchGate, PatchQuality, PublishDecision};
pub use stage::{Stage, StageStateMachine, TransitionError, TransitionRecord};
pub use store::{Command, ContextSlot, ContextStore};
