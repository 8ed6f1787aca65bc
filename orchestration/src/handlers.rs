//! Stage handler interface.
//!
//! The engine never talks to a language model or code host directly. Each
//! executable stage after intake maps to one [`HandlerKind`], and each kind
//! to the dependency whose breaker guards it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::Dependency;
use crate::error::StageError;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::Stage;
use crate::ticket::PatchAttempt;

/// What a successful stage hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    pub summary: String,
    /// Candidate patch (development stage only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchAttempt>,
    /// Free-form data for later stages; `null` stores nothing.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StageOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_patch(mut self, patch: PatchAttempt) -> Self {
        self.patch = Some(patch);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Result type for stage executions
pub type StageResult = Result<StageOutput, StageError>;

/// A stage handler. Receives a snapshot of the context.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, context: &PipelineContext) -> StageResult;
}

/// The closed set of external stage handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Planner,
    Developer,
    Qa,
    Communicator,
}

impl HandlerKind {
    /// Handler for `stage`. Intake runs inside the engine and terminal
    /// stages run nothing.
    pub fn for_stage(stage: Stage) -> Option<HandlerKind> {
        match stage {
            Stage::Planning => Some(Self::Planner),
            Stage::Development => Some(Self::Developer),
            Stage::Qa => Some(Self::Qa),
            Stage::Communication => Some(Self::Communicator),
            Stage::Intake | Stage::Completed | Stage::Failed | Stage::Escalated => None,
        }
    }

    pub fn dependency(self) -> Dependency {
        match self {
            Self::Planner | Self::Developer | Self::Qa => Dependency::LanguageModel,
            Self::Communicator => Dependency::CodeHost,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Developer => "developer",
            Self::Qa => "qa",
            Self::Communicator => "communicator",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One executor per handler kind, fixed at construction.
#[derive(Clone)]
pub struct StageHandlers {
    pub planner: Arc<dyn StageExecutor>,
    pub developer: Arc<dyn StageExecutor>,
    pub qa: Arc<dyn StageExecutor>,
    pub communicator: Arc<dyn StageExecutor>,
}

impl StageHandlers {
    pub fn new(
        planner: Arc<dyn StageExecutor>,
        developer: Arc<dyn StageExecutor>,
        qa: Arc<dyn StageExecutor>,
        communicator: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            planner,
            developer,
            qa,
            communicator,
        }
    }

    pub fn get(&self, kind: HandlerKind) -> Arc<dyn StageExecutor> {
        match kind {
            HandlerKind::Planner => self.planner.clone(),
            HandlerKind::Developer => self.developer.clone(),
            HandlerKind::Qa => self.qa.clone(),
            HandlerKind::Communicator => self.communicator.clone(),
        }
    }
}

impl std::fmt::Debug for StageHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandlers").finish_non_exhaustive()
    }
}
