//! Error taxonomy with retry classification.
//!
//! Stage handlers and the circuit breakers report failures as
//! [`StageError`]. The dispatcher never string-matches: it asks for
//! [`StageError::kind`] and routes on the [`FailureKind`].
//!
//! | Kind        | Retried              | Counts against breaker | Outcome on give-up      |
//! |-------------|----------------------|------------------------|-------------------------|
//! | Transient   | yes, with backoff    | yes                    | escalation policy       |
//! | CircuitOpen | waits, no attempt    | no                     | escalation policy       |
//! | Validation  | no                   | no                     | escalation policy       |
//! | Fatal       | no                   | no                     | context frozen          |
//!
//! Engine-level failures (unknown tickets, rejected commands, bad
//! configuration) are [`EngineError`].

use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::Dependency;
use crate::config::ConfigError;
use crate::pipeline::stage::{Stage, TransitionError};
use crate::ticket::TicketId;

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Dependency timeout, rate limit, dropped connection.
    Transient,
    /// Dependency isolated by its circuit breaker; ticket content not evaluated.
    CircuitOpen,
    /// Malformed ticket or no viable patch.
    Validation,
    /// Invariant violation inside the engine.
    Fatal,
}

impl FailureKind {
    /// Whether the retry policy may schedule another attempt.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether the failure says anything about the ticket itself.
    pub fn is_content_related(self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Validation => write!(f, "validation"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure reported by a stage execution.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Circuit open for {dependency} (retry in {}ms)", .retry_after.as_millis())]
    CircuitOpen {
        dependency: Dependency,
        retry_after: Duration,
    },

    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Validation(_) => FailureKind::Validation,
            Self::Fatal(_) => FailureKind::Fatal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Whether the failure should trip the dependency's circuit breaker.
    ///
    /// A validation outcome means the dependency answered; fatal errors
    /// originate inside the engine.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Engine-level error surfaced to callers of the query/command interface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown ticket: {0}")]
    UnknownTicket(TicketId),

    #[error("Stage {0} has no registry entry")]
    UnknownStage(Stage),

    #[error("Ticket {ticket_id}: {source}")]
    Transition {
        ticket_id: TicketId,
        #[source]
        source: TransitionError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retriable() {
        assert!(StageError::transient("timeout").is_retriable());
        assert!(!StageError::validation("empty title").is_retriable());
        assert!(!StageError::fatal("bad state").is_retriable());
        let open = StageError::CircuitOpen {
            dependency: Dependency::LanguageModel,
            retry_after: Duration::from_secs(3),
        };
        assert!(!open.is_retriable());
        assert_eq!(open.kind(), FailureKind::CircuitOpen);
    }

    #[test]
    fn test_circuit_open_is_not_content_related() {
        assert!(!FailureKind::CircuitOpen.is_content_related());
        assert!(FailureKind::Transient.is_content_related());
        assert!(FailureKind::Validation.is_content_related());
    }

    #[test]
    fn test_only_transient_trips_breaker() {
        assert!(StageError::transient("503").is_dependency_failure());
        assert!(!StageError::validation("low confidence").is_dependency_failure());
        assert!(!StageError::fatal("oops").is_dependency_failure());
    }

    #[test]
    fn test_display_messages() {
        let open = StageError::CircuitOpen {
            dependency: Dependency::CodeHost,
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(open.to_string(), "Circuit open for code_host (retry in 1500ms)");
        assert_eq!(FailureKind::CircuitOpen.to_string(), "circuit_open");
    }
}
