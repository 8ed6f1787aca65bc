//! Stage state machine: explicit stages and legal transition guards.
//!
//! Every pipeline context owns a [`StageStateMachine`] so that:
//! 1. Every stage transition is auditable and logged.
//! 2. Illegal transitions are rejected by `advance()` guards.
//! 3. At most one stage is in flight at any time (`begin()` / `finish()`).
//!
//! Runs start at `Intake` and end in `Completed`, `Failed` or `Escalated`.
//! The two failure states are absorbing: only an explicit `rearm()` (the
//! external retry command) moves a context out of them.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ticket::TrackerStatus;

/// The set of pipeline stages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Ticket validation, scoring and complexity assessment.
    Intake,
    /// Root-cause analysis and fix plan.
    Planning,
    /// Patch generation.
    Development,
    /// Patch validation in the sandbox.
    Qa,
    /// Pull request and tracker update.
    Communication,
    /// All stages succeeded; terminal.
    Completed,
    /// Gave up without human review (dependency unavailable); terminal.
    Failed,
    /// Handed to human review; terminal.
    Escalated,
}

impl Stage {
    /// Executable stages in pipeline order.
    pub fn pipeline() -> &'static [Stage] {
        &[
            Self::Intake,
            Self::Planning,
            Self::Development,
            Self::Qa,
            Self::Communication,
        ]
    }

    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Escalated)
    }

    /// Stage that follows a success of this one.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Intake => Some(Self::Planning),
            Self::Planning => Some(Self::Development),
            Self::Development => Some(Self::Qa),
            Self::Qa => Some(Self::Communication),
            Self::Communication => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Escalated => None,
        }
    }

    /// Status reported back to the ticket tracker.
    pub fn tracker_status(self) -> TrackerStatus {
        match self {
            Self::Intake | Self::Planning | Self::Development => TrackerStatus::InProgress,
            Self::Qa => TrackerStatus::Testing,
            Self::Communication => TrackerStatus::InReview,
            Self::Completed => TrackerStatus::Completed,
            Self::Failed => TrackerStatus::Failed,
            Self::Escalated => TrackerStatus::Escalated,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Planning => "planning",
            Self::Development => "development",
            Self::Qa => "qa",
            Self::Communication => "communication",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intake" => Ok(Self::Intake),
            "planning" | "planner" => Ok(Self::Planning),
            "development" | "developer" => Ok(Self::Development),
            "qa" => Ok(Self::Qa),
            "communication" | "communicator" => Ok(Self::Communication),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Legal transitions between stages.
///
/// ```text
/// Intake → Planning → Development → Qa → Communication → Completed
/// any non-terminal → Failed | Escalated
/// ```
fn is_legal_transition(from: Stage, to: Stage) -> bool {
    use Stage::*;

    if from.is_terminal() {
        return false;
    }

    // Any non-terminal stage can halt.
    if matches!(to, Failed | Escalated) {
        return true;
    }

    from.next() == Some(to)
}

/// A single recorded stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
    /// Optional context about why this transition happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when a transition or attempt would break the state graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Illegal stage transition: {from} → {to}")]
    Illegal { from: Stage, to: Stage },

    #[error("Stage {0} is already in flight")]
    AlreadyInFlight(Stage),

    #[error("No stage in flight")]
    NotInFlight,

    #[error("Stage {0} is terminal")]
    Terminal(Stage),

    #[error("Context is frozen at {0}")]
    Frozen(Stage),
}

/// Per-ticket stage state machine.
///
/// Tracks the current stage and the in-flight marker, enforces legal
/// transitions, and keeps the full transition log for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStateMachine {
    current: Stage,
    in_flight: Option<Stage>,
    transitions: Vec<TransitionRecord>,
}

impl StageStateMachine {
    /// Create a new state machine starting at `Intake`.
    pub fn new() -> Self {
        Self {
            current: Stage::Intake,
            in_flight: None,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    pub fn in_flight(&self) -> Option<Stage> {
        self.in_flight
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Mark the current stage as in flight.
    pub fn begin(&mut self) -> Result<Stage, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::Terminal(self.current));
        }
        if let Some(stage) = self.in_flight {
            return Err(TransitionError::AlreadyInFlight(stage));
        }
        self.in_flight = Some(self.current);
        Ok(self.current)
    }

    /// Clear the in-flight marker, returning the stage that was running.
    pub fn finish(&mut self) -> Result<Stage, TransitionError> {
        self.in_flight.take().ok_or(TransitionError::NotInFlight)
    }

    /// Attempt to advance to `to`.
    ///
    /// Rejected while a stage is in flight or if `to` is not a legal edge.
    pub fn advance(&mut self, to: Stage, reason: Option<&str>) -> Result<(), TransitionError> {
        if let Some(stage) = self.in_flight {
            return Err(TransitionError::AlreadyInFlight(stage));
        }
        if !is_legal_transition(self.current, to) {
            return Err(TransitionError::Illegal {
                from: self.current,
                to,
            });
        }
        self.record(to, reason);
        Ok(())
    }

    /// Advance to the stage after the current one.
    pub fn complete_stage(&mut self) -> Result<Stage, TransitionError> {
        let next = self
            .current
            .next()
            .ok_or(TransitionError::Terminal(self.current))?;
        self.advance(next, None)?;
        Ok(next)
    }

    /// Re-enter `stage` from `Failed` or `Escalated` on an explicit retry.
    pub fn rearm(&mut self, stage: Stage, reason: Option<&str>) -> Result<(), TransitionError> {
        let legal = matches!(self.current, Stage::Failed | Stage::Escalated)
            && !stage.is_terminal()
            && self.in_flight.is_none();
        if !legal {
            return Err(TransitionError::Illegal {
                from: self.current,
                to: stage,
            });
        }
        self.record(stage, reason);
        Ok(())
    }

    fn record(&mut self, to: Stage, reason: Option<&str>) {
        tracing::debug!(from = %self.current, to = %to, "Stage transition");
        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            at: Utc::now(),
            reason: reason.map(String::from),
        });
        self.current = to;
    }

    /// Get the full transition log.
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line history, e.g. `intake → planning → failed (2 transitions)`.
    pub fn summary(&self) -> String {
        let mut path = vec![Stage::Intake.to_string()];
        path.extend(self.transitions.iter().map(|t| t.to.to_string()));
        format!(
            "{} ({} transitions)",
            path.join(" → "),
            self.transitions.len()
        )
    }
}

impl Default for StageStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_at(stage: Stage) -> StageStateMachine {
        StageStateMachine {
            current: stage,
            in_flight: None,
            transitions: Vec::new(),
        }
    }

    fn run_stage(sm: &mut StageStateMachine) -> Stage {
        sm.begin().unwrap();
        sm.finish().unwrap();
        sm.complete_stage().unwrap()
    }

    #[test]
    fn test_initial_state() {
        let sm = StageStateMachine::new();
        assert_eq!(sm.current(), Stage::Intake);
        assert!(!sm.is_terminal());
        assert!(sm.in_flight().is_none());
        assert_eq!(sm.transitions().len(), 0);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut sm = StageStateMachine::new();
        let mut visited = Vec::new();
        while !sm.is_terminal() {
            visited.push(run_stage(&mut sm));
        }
        assert_eq!(
            visited,
            vec![
                Stage::Planning,
                Stage::Development,
                Stage::Qa,
                Stage::Communication,
                Stage::Completed
            ]
        );
        assert_eq!(sm.transitions().len(), 5);
    }

    #[test]
    fn test_single_stage_in_flight() {
        let mut sm = StageStateMachine::new();
        sm.begin().unwrap();
        assert_eq!(
            sm.begin().unwrap_err(),
            TransitionError::AlreadyInFlight(Stage::Intake)
        );
        // Cannot advance while the attempt is running.
        assert!(sm.advance(Stage::Planning, None).is_err());
        assert_eq!(sm.finish().unwrap(), Stage::Intake);
        assert_eq!(sm.finish().unwrap_err(), TransitionError::NotInFlight);
    }

    #[test]
    fn test_halt_from_any_stage() {
        for &stage in Stage::pipeline() {
            for halt in [Stage::Failed, Stage::Escalated] {
                let mut sm = machine_at(stage);
                assert!(sm.advance(halt, Some("test")).is_ok());
                assert!(sm.is_terminal());
            }
        }
    }

    #[test]
    fn test_cannot_transition_from_terminal() {
        for terminal in [Stage::Completed, Stage::Failed, Stage::Escalated] {
            let mut sm = machine_at(terminal);
            assert!(sm.advance(Stage::Escalated, None).is_err());
            assert_eq!(sm.begin().unwrap_err(), TransitionError::Terminal(terminal));
        }
    }

    #[test]
    fn test_illegal_skip_and_backward() {
        let mut sm = StageStateMachine::new();
        let err = sm.advance(Stage::Development, None).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: Stage::Intake,
                to: Stage::Development
            }
        );

        let mut sm = machine_at(Stage::Qa);
        assert!(sm.advance(Stage::Planning, None).is_err());
    }

    #[test]
    fn test_rearm_only_from_failed_or_escalated() {
        let mut sm = machine_at(Stage::Development);
        sm.advance(Stage::Escalated, Some("retries exhausted")).unwrap();
        sm.rearm(Stage::Development, Some("retry command")).unwrap();
        assert_eq!(sm.current(), Stage::Development);

        let mut done = machine_at(Stage::Completed);
        assert!(done.rearm(Stage::Intake, None).is_err());

        let mut active = machine_at(Stage::Planning);
        assert!(active.rearm(Stage::Planning, None).is_err());

        let mut failed = machine_at(Stage::Failed);
        assert!(failed.rearm(Stage::Escalated, None).is_err());
    }

    #[test]
    fn test_transition_record_has_reason() {
        let mut sm = StageStateMachine::new();
        sm.advance(Stage::Failed, Some("dependency unavailable")).unwrap();

        let record = &sm.transitions()[0];
        assert_eq!(record.from, Stage::Intake);
        assert_eq!(record.to, Stage::Failed);
        assert_eq!(record.reason.as_deref(), Some("dependency unavailable"));
    }

    #[test]
    fn test_tracker_status_mapping() {
        assert_eq!(Stage::Planning.tracker_status(), TrackerStatus::InProgress);
        assert_eq!(Stage::Qa.tracker_status(), TrackerStatus::Testing);
        assert_eq!(Stage::Communication.tracker_status(), TrackerStatus::InReview);
        assert_eq!(Stage::Escalated.tracker_status(), TrackerStatus::Escalated);
    }

    #[test]
    fn test_stage_parse_and_display() {
        assert_eq!("Developer".parse::<Stage>().unwrap(), Stage::Development);
        assert_eq!(Stage::Communication.to_string(), "communication");
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn test_summary() {
        let mut sm = StageStateMachine::new();
        run_stage(&mut sm);
        sm.advance(Stage::Escalated, None).unwrap();
        let summary = sm.summary();
        assert_eq!(summary, "intake → planning → escalated (2 transitions)");
    }
}
