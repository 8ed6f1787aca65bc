//! Escalation policy: deterministic halt decisions.
//!
//! Invoked once a stage has given up: retries exhausted, a validation
//! failure, a development patch below the confidence gate, or too many
//! circuit-open waits. Looks only at the recent failures of the stage; no
//! I/O and no clock.
//!
//! If every recent failure is `CircuitOpen`, nothing is known about the
//! ticket itself, so it is failed with a retry-later note instead of
//! being handed to a human.

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::pipeline::stage::Stage;

/// Configuration for the escalation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Number of most recent failures inspected
    pub failure_window: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self { failure_window: 3 }
    }
}

/// Why the policy was consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// Transient retry budget spent
    RetriesExhausted,
    /// Non-retriable validation failure
    Validation,
    /// Development produced no patch at or above the confidence gate
    LowConfidence,
    /// Dependency stayed isolated for too many waits
    CircuitWaitsExhausted,
    /// Operator `escalate` command
    Manual,
}

impl std::fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted => write!(f, "retries exhausted"),
            Self::Validation => write!(f, "validation failure"),
            Self::LowConfidence => write!(f, "no patch above confidence threshold"),
            Self::CircuitWaitsExhausted => write!(f, "dependency unavailable"),
            Self::Manual => write!(f, "manual escalation"),
        }
    }
}

/// Decision produced by the policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationDecision {
    /// `Stage::Failed` or `Stage::Escalated`
    pub outcome: Stage,
    /// Whether the ticket should simply be retried later
    pub retry_later: bool,
    /// Human-readable annotation stored on the context
    pub reason: String,
}

impl EscalationDecision {
    pub fn is_escalated(&self) -> bool {
        self.outcome == Stage::Escalated
    }
}

/// The escalation policy
#[derive(Debug, Clone, Default)]
pub struct EscalationPolicy {
    config: EscalationConfig,
}

impl EscalationPolicy {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Decide from the failures recorded against the stage, oldest first.
    pub fn decide(&self, failures: &[FailureKind], trigger: EscalationTrigger) -> EscalationDecision {
        if trigger == EscalationTrigger::Manual {
            return EscalationDecision {
                outcome: Stage::Escalated,
                retry_later: false,
                reason: trigger.to_string(),
            };
        }

        let start = failures.len().saturating_sub(self.config.failure_window);
        let window = &failures[start..];
        let dependency_only =
            !window.is_empty() && window.iter().all(|k| *k == FailureKind::CircuitOpen);

        if dependency_only {
            EscalationDecision {
                outcome: Stage::Failed,
                retry_later: true,
                reason: format!(
                    "{trigger}: last {} failures were circuit-open; retry later",
                    window.len()
                ),
            }
        } else {
            let content = window.iter().filter(|k| k.is_content_related()).count();
            EscalationDecision {
                outcome: Stage::Escalated,
                retry_later: false,
                reason: format!(
                    "{trigger}: {content} of last {} failures content-related",
                    window.len()
                ),
            }
        }
    }
}
