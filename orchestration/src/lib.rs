//! Remediation Pipeline Orchestration Library
//!
//! This library drives defect tickets through a fixed stage sequence:
//! intake → planning → development → qa → communication. It decides
//! retries, isolates failing dependencies and escalates to humans.
//!
//! # Components
//!
//! ## Leaves
//! - `priority`: ticket → ordering score in [0, 1]
//! - `complexity`: ticket → low / medium / high
//! - `retry`: exponential backoff decisions
//! - `circuit_breaker`: per-dependency failure isolation
//!
//! ## Pipeline
//! - `pipeline::stage`: stage state machine with transition guards
//! - `pipeline::context`: per-ticket progress, records and patches
//! - `escalation`: failed vs escalated when a stage gives up
//! - `registry`: per-stage enable flag and rolling metrics
//! - `dispatcher`: priority scheduling under concurrency caps
//! - `events`: bounded broadcast of ticket, agent and alert events
//!
//! # Usage
//!
//! ```ignore
//! let config = EngineConfig::default();
//! let resources = SharedResources::from_config(&config);
//! let dispatcher = Dispatcher::new(config, handlers, resources)?.shared();
//!
//! dispatcher.submit(ticket).await;
//! tokio::spawn(dispatcher.clone().run(shutdown.clone()));
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod circuit_breaker;
pub mod complexity;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod escalation;
pub mod events;
pub mod handlers;
pub mod pipeline;
pub mod priority;
pub mod registry;
pub mod retry;
pub mod source;
pub mod ticket;

// Re-export key engine types
pub use circuit_breaker::{
    BreakerConfig, CircuitBreaker, CircuitBreakerState, CircuitBreakers, CircuitState,
    Dependency, SharedBreakers,
};
pub use complexity::{ComplexityClass, ComplexityConfig, ComplexityEstimator};
pub use config::{ConfigError, ConfigResult, DispatchConfig, EngineConfig, ReprocessPolicy};
pub use dispatcher::{CommandOutcome, Dispatcher, SharedDispatcher, SharedResources, SubmitOutcome};
pub use error::{EngineError, EngineResult, FailureKind, StageError};
pub use escalation::{EscalationConfig, EscalationDecision, EscalationPolicy, EscalationTrigger};
pub use handlers::{HandlerKind, StageExecutor, StageHandlers, StageOutput, StageResult};
pub use priority::{PriorityConfig, PriorityScorer, ScoreBreakdown};
pub use registry::{AgentRegistry, AgentRegistryEntry, SharedAgentRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use source::{TicketCursor, TicketFilter, TicketSource};
pub use ticket::{PatchAttempt, ReportedPriority, Ticket, TicketId, TrackerStatus};

// Re-export pipeline types
pub use pipeline::{
    PatchConfig, PatchGate, PipelineContext, PipelineSummary, PublishDecision, Stage,
    StageExecutionRecord, StageOutcome, StageStateMachine, TransitionError,
};

// Re-export event types
pub use events::{
    AlertSeverity, EventBroadcaster, EventBusExt, EventFilter, EventSubscriber, PipelineEvent,
    SharedEventBroadcaster,
};
