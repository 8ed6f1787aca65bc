//! Per-ticket orchestration state.
//!
//! A [`PipelineContext`] is created when a ticket is submitted and is only
//! mutated by the dispatcher while it holds the ticket's execution slot.
//! Checkpoints, execution records and patch attempts are append-only.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::complexity::ComplexityClass;
use crate::error::{FailureKind, StageError};
use crate::handlers::StageOutput;
use crate::pipeline::patch::PublishDecision;
use crate::pipeline::stage::{Stage, StageStateMachine, TransitionError, TransitionRecord};
use crate::ticket::{PatchAttempt, Ticket, TicketId};

/// Result of one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure { kind: FailureKind, message: String },
}

/// Immutable log entry, one per attempt.
#[derive(Debug, Clone, Serialize)]
pub struct StageExecutionRecord {
    pub stage: Stage,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Timing of an attempt, captured by the worker that ran it.
#[derive(Debug, Clone, Copy)]
pub struct AttemptTiming {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl AttemptTiming {
    fn finished_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.started_at.checked_add_signed(d))
            .unwrap_or(self.started_at)
    }
}

/// Attempt outcomes, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: u32,
    pub transient: u32,
    pub circuit_open: u32,
    pub validation: u32,
    pub fatal: u32,
}

/// Condensed view of a context for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub context_id: String,
    pub ticket_id: TicketId,
    pub tracker_id: String,
    pub current_stage: Stage,
    pub completed_stages: usize,
    pub total_duration_ms: u64,
    pub outcomes: OutcomeCounts,
    pub has_errors: bool,
    pub frozen: bool,
    pub checkpoints: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineContext {
    context_id: String,
    ticket: Ticket,
    machine: StageStateMachine,
    attempts: BTreeMap<Stage, u32>,
    /// Consecutive circuit-open rejections for the current stage.
    circuit_waits: u32,
    /// Failure kinds recorded against the current stage, oldest first.
    failures: Vec<FailureKind>,
    has_errors: bool,
    checkpoints: Vec<Stage>,
    records: Vec<StageExecutionRecord>,
    patch_attempts: Vec<PatchAttempt>,
    stage_data: BTreeMap<Stage, serde_json::Value>,
    priority_score: f64,
    complexity: ComplexityClass,
    total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    resume_deadline: Option<Instant>,
    /// Stage that was running when the context halted or froze.
    #[serde(skip_serializing_if = "Option::is_none")]
    halted_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frozen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    publish_decision: Option<PublishDecision>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    terminal_at: Option<DateTime<Utc>>,
}

impl PipelineContext {
    pub fn new(ticket: Ticket, priority_score: f64, complexity: ComplexityClass) -> Self {
        let now = Utc::now();
        Self {
            context_id: uuid::Uuid::new_v4().to_string(),
            ticket,
            machine: StageStateMachine::new(),
            attempts: BTreeMap::new(),
            circuit_waits: 0,
            failures: Vec::new(),
            has_errors: false,
            checkpoints: Vec::new(),
            records: Vec::new(),
            patch_attempts: Vec::new(),
            stage_data: BTreeMap::new(),
            priority_score,
            complexity,
            total_duration_ms: 0,
            resume_at: None,
            resume_deadline: None,
            halted_stage: None,
            frozen: None,
            annotation: None,
            publish_decision: None,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    pub fn ticket_id(&self) -> &str {
        &self.ticket.id
    }

    pub fn current_stage(&self) -> Stage {
        self.machine.current()
    }

    pub fn in_flight(&self) -> Option<Stage> {
        self.machine.in_flight()
    }

    pub fn is_terminal(&self) -> bool {
        self.machine.is_terminal()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    pub fn frozen_reason(&self) -> Option<&str> {
        self.frozen.as_deref()
    }

    pub fn priority_score(&self) -> f64 {
        self.priority_score
    }

    pub fn complexity(&self) -> ComplexityClass {
        self.complexity
    }

    /// Attempts started for `stage` since it was last (re-)entered.
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Attempt number of the current stage.
    pub fn current_attempt(&self) -> u32 {
        self.attempts(self.current_stage())
    }

    pub fn circuit_waits(&self) -> u32 {
        self.circuit_waits
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn checkpoints(&self) -> &[Stage] {
        &self.checkpoints
    }

    pub fn records(&self) -> &[StageExecutionRecord] {
        &self.records
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        self.machine.transitions()
    }

    pub fn patch_attempts(&self) -> &[PatchAttempt] {
        &self.patch_attempts
    }

    /// Most recent patch that applied cleanly.
    pub fn latest_patch(&self) -> Option<&PatchAttempt> {
        self.patch_attempts.iter().rev().find(|p| p.success)
    }

    /// Output data recorded by a successful stage.
    pub fn stage_data(&self, stage: Stage) -> Option<&serde_json::Value> {
        self.stage_data.get(&stage)
    }

    pub fn publish_decision(&self) -> Option<PublishDecision> {
        self.publish_decision
    }

    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    pub fn halted_stage(&self) -> Option<Stage> {
        self.halted_stage
    }

    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        self.resume_at
    }

    pub(crate) fn resume_deadline(&self) -> Option<Instant> {
        self.resume_deadline
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.terminal_at
    }

    /// The last `window` failures recorded against the current stage.
    pub fn recent_failures(&self, window: usize) -> &[FailureKind] {
        let start = self.failures.len().saturating_sub(window);
        &self.failures[start..]
    }

    /// Whether the dispatcher may start the next attempt now.
    pub fn is_ready(&self, now: Instant) -> bool {
        !self.is_terminal()
            && !self.is_frozen()
            && self.in_flight().is_none()
            && self.resume_deadline.map_or(true, |at| at <= now)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn clear_resume(&mut self) {
        self.resume_deadline = None;
        self.resume_at = None;
    }

    fn reset_stage_budget(&mut self, stage: Stage) {
        self.attempts.insert(stage, 0);
        self.failures.clear();
        self.circuit_waits = 0;
        self.clear_resume();
    }

    /// Claim the current stage. Returns the stage and its attempt number.
    pub(crate) fn begin_attempt(&mut self) -> Result<(Stage, u32), TransitionError> {
        if self.is_frozen() {
            return Err(TransitionError::Frozen(self.current_stage()));
        }
        let stage = self.machine.begin()?;
        let attempt = self.attempts.entry(stage).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        self.clear_resume();
        self.touch();
        Ok((stage, attempt))
    }

    /// Record a successful attempt and advance to the next stage.
    pub(crate) fn record_success(
        &mut self,
        timing: AttemptTiming,
        output: StageOutput,
    ) -> Result<Stage, TransitionError> {
        let stage = self.machine.finish()?;
        self.push_record(stage, timing, StageOutcome::Success, Some(output.summary));
        self.checkpoints.push(stage);
        if !output.data.is_null() {
            self.stage_data.insert(stage, output.data);
        }
        if let Some(patch) = output.patch {
            self.patch_attempts.push(patch);
        }
        self.failures.clear();
        self.circuit_waits = 0;

        let next = self.machine.complete_stage()?;
        if next.is_terminal() {
            self.terminal_at = Some(Utc::now());
        }
        self.touch();
        Ok(next)
    }

    /// Record a failed attempt. The stage stays current.
    ///
    /// A circuit-open rejection gives the attempt back: the stage was never
    /// evaluated.
    pub(crate) fn record_failure(
        &mut self,
        timing: AttemptTiming,
        error: &StageError,
    ) -> Result<Stage, TransitionError> {
        let stage = self.machine.finish()?;
        let kind = error.kind();
        self.push_record(
            stage,
            timing,
            StageOutcome::Failure {
                kind,
                message: error.to_string(),
            },
            None,
        );
        self.has_errors = true;
        self.failures.push(kind);
        if kind == FailureKind::CircuitOpen {
            if let Some(count) = self.attempts.get_mut(&stage) {
                *count = count.saturating_sub(1);
            }
            self.circuit_waits += 1;
        } else {
            self.circuit_waits = 0;
        }
        self.touch();
        Ok(stage)
    }

    /// Keep a patch that did not pass the gate, for the record.
    pub(crate) fn record_patch(&mut self, patch: PatchAttempt) {
        self.patch_attempts.push(patch);
    }

    pub(crate) fn set_publish_decision(&mut self, decision: PublishDecision) {
        self.publish_decision = Some(decision);
    }

    /// Hold the context until `delay` has elapsed.
    pub(crate) fn schedule_resume(&mut self, delay: Duration) {
        self.resume_deadline = Some(Instant::now() + delay);
        self.resume_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.touch();
    }

    /// Move to `Failed` or `Escalated`.
    pub(crate) fn terminate(&mut self, outcome: Stage, reason: &str) -> Result<(), TransitionError> {
        let halted = self.current_stage();
        self.machine.advance(outcome, Some(reason))?;
        self.halted_stage = Some(halted);
        self.annotation = Some(reason.to_string());
        self.frozen = None;
        self.clear_resume();
        self.terminal_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Stop scheduling this context until an explicit retry.
    pub(crate) fn freeze(&mut self, reason: &str) {
        self.halted_stage = Some(self.current_stage());
        self.frozen = Some(reason.to_string());
        self.clear_resume();
        self.touch();
    }

    /// Apply a retry command. Returns the stage that will run next as
    /// attempt 1.
    pub(crate) fn rearm(&mut self, reason: &str) -> Result<Stage, TransitionError> {
        if let Some(stage) = self.in_flight() {
            return Err(TransitionError::AlreadyInFlight(stage));
        }

        let stage = match self.current_stage() {
            Stage::Failed | Stage::Escalated => {
                let stage = self.halted_stage.unwrap_or(Stage::Intake);
                self.machine.rearm(stage, Some(reason))?;
                self.terminal_at = None;
                stage
            }
            Stage::Completed => {
                return Err(TransitionError::Terminal(Stage::Completed));
            }
            active => active,
        };

        self.frozen = None;
        self.annotation = None;
        self.reset_stage_budget(stage);
        self.touch();
        Ok(stage)
    }

    fn push_record(
        &mut self,
        stage: Stage,
        timing: AttemptTiming,
        outcome: StageOutcome,
        summary: Option<String>,
    ) {
        let duration_ms = u64::try_from(timing.duration.as_millis()).unwrap_or(u64::MAX);
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        self.records.push(StageExecutionRecord {
            stage,
            attempt: timing.attempt,
            started_at: timing.started_at,
            finished_at: timing.finished_at(),
            duration_ms,
            outcome,
            summary,
        });
    }

    pub fn outcome_counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for record in &self.records {
            match &record.outcome {
                StageOutcome::Success => counts.success += 1,
                StageOutcome::Failure { kind, .. } => match kind {
                    FailureKind::Transient => counts.transient += 1,
                    FailureKind::CircuitOpen => counts.circuit_open += 1,
                    FailureKind::Validation => counts.validation += 1,
                    FailureKind::Fatal => counts.fatal += 1,
                },
            }
        }
        counts
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            context_id: self.context_id.clone(),
            ticket_id: self.ticket.id.clone(),
            tracker_id: self.ticket.tracker_id.clone(),
            current_stage: self.current_stage(),
            completed_stages: self.checkpoints.len(),
            total_duration_ms: self.total_duration_ms,
            outcomes: self.outcome_counts(),
            has_errors: self.has_errors,
            frozen: self.is_frozen(),
            checkpoints: self.checkpoints.clone(),
            annotation: self.annotation.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
