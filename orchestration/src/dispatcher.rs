//! Dispatcher: priority scheduling, bounded execution and failure routing.
//!
//! ```text
//! submit ──▶ ContextStore ──ready()──▶ dispatch_ready ──spawn──▶ worker
//!                 ▲                      │ global cap               │
//!                 │                      │ per-dependency cap       │ breaker.call(handler)
//!                 └──── complete_attempt ◀──────────────────────────┘
//!                        success  → checkpoint, next stage
//!                        failure  → RetryPolicy → EscalationPolicy
//!                        fatal    → freeze
//! ```
//!
//! Each ticket has at most one stage in flight: the slot is claimed under
//! the store lock before a worker is spawned and released by
//! `complete_attempt`. Operator commands that arrive in between are queued
//! on the slot and applied right after the attempt settles.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreakerState, CircuitBreakers, Dependency, SharedBreakers};
use crate::complexity::ComplexityEstimator;
use crate::config::{EngineConfig, ReprocessPolicy};
use crate::error::{EngineError, EngineResult, StageError};
use crate::escalation::{EscalationPolicy, EscalationTrigger};
use crate::events::{AlertSeverity, EventBroadcaster, PipelineEvent, SharedEventBroadcaster};
use crate::handlers::{HandlerKind, StageHandlers, StageOutput, StageResult};
use crate::pipeline::context::{AttemptTiming, PipelineContext, PipelineSummary};
use crate::pipeline::patch::PatchGate;
use crate::pipeline::stage::{Stage, TransitionError};
use crate::pipeline::store::{Command, ContextSlot, ContextStore};
use crate::priority::PriorityScorer;
use crate::registry::{AgentRegistry, AgentRegistryEntry, SharedAgentRegistry};
use crate::retry::RetryDecision;
use crate::ticket::{PatchAttempt, Ticket, TrackerStatus};

/// Handles shared between the dispatcher and everything observing it.
#[derive(Debug, Clone)]
pub struct SharedResources {
    pub events: SharedEventBroadcaster,
    pub breakers: SharedBreakers,
    pub registry: SharedAgentRegistry,
}

impl SharedResources {
    pub fn from_config(config: &EngineConfig) -> Self {
        let events = EventBroadcaster::with_capacity(config.events.capacity).shared();
        let breakers =
            CircuitBreakers::with_events(config.breaker.clone(), events.clone()).shared();
        let registry = AgentRegistry::new(config.registry.window)
            .with_events(events.clone())
            .shared();
        Self {
            events,
            breakers,
            registry,
        }
    }
}

/// What happened to a submitted ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New context created.
    Accepted,
    /// Already known; left untouched.
    Skipped,
    /// Known and halted; re-armed by the reprocess policy.
    Rearmed,
    /// Known; replaced with a fresh context.
    Reset,
}

/// Whether a command took effect now or waits for the in-flight attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    Queued,
}

/// Result of one attempt after the development gate.
enum AttemptResult {
    Success(StageOutput),
    Failure {
        error: StageError,
        rejected_patch: Option<PatchAttempt>,
    },
}

/// Shared reference to Dispatcher
pub type SharedDispatcher = Arc<Dispatcher>;

pub struct Dispatcher {
    config: EngineConfig,
    scorer: PriorityScorer,
    estimator: ComplexityEstimator,
    escalation: EscalationPolicy,
    gate: PatchGate,
    handlers: StageHandlers,
    resources: SharedResources,
    store: ContextStore,
    global: Arc<Semaphore>,
    per_dependency: HashMap<Dependency, Arc<Semaphore>>,
    wake: Notify,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("global_available", &self.global.available_permits())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Dispatcher {
    /// Validate `config` and build a dispatcher over `resources`.
    pub fn new(
        config: EngineConfig,
        handlers: StageHandlers,
        resources: SharedResources,
    ) -> EngineResult<Self> {
        config.validate()?;
        let scorer = PriorityScorer::new(config.priority.clone())?;
        let per_dependency = Dependency::all()
            .iter()
            .map(|&dep| {
                (
                    dep,
                    Arc::new(Semaphore::new(config.dispatch.dependency_concurrency)),
                )
            })
            .collect();

        Ok(Self {
            estimator: ComplexityEstimator::new(config.complexity.clone()),
            escalation: EscalationPolicy::new(config.escalation.clone()),
            gate: PatchGate::new(config.patch.clone()),
            global: Arc::new(Semaphore::new(config.dispatch.global_concurrency)),
            per_dependency,
            scorer,
            handlers,
            resources,
            store: ContextStore::new(),
            wake: Notify::new(),
            config,
        })
    }

    pub fn shared(self) -> SharedDispatcher {
        Arc::new(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.resources.events.subscribe()
    }

    fn publish(&self, event: PipelineEvent) {
        self.resources.events.publish(event);
    }

    fn publish_update(&self, ctx: &PipelineContext, message: impl Into<String>) {
        let status = ctx.current_stage().tracker_status();
        self.publish(PipelineEvent::ticket_update(ctx, status, message));
    }

    // ── Intake ──────────────────────────────────────────────────────────

    /// Register a ticket. Score and complexity are computed here so the
    /// ready set can order intake work.
    pub async fn submit(&self, ticket: Ticket) -> SubmitOutcome {
        let ticket_id = ticket.id.clone();
        let mut slots = self.store.write().await;

        let outcome = match slots.get_mut(&ticket_id) {
            Some(slot) if slot.context.in_flight().is_some() => SubmitOutcome::Skipped,
            Some(slot) => match self.config.reprocess {
                ReprocessPolicy::Skip => SubmitOutcome::Skipped,
                ReprocessPolicy::Unblock => {
                    let halted = slot.context.is_frozen()
                        || matches!(
                            slot.context.current_stage(),
                            Stage::Failed | Stage::Escalated
                        );
                    if halted && self.apply_command(&mut slot.context, Command::Retry).is_ok() {
                        SubmitOutcome::Rearmed
                    } else {
                        SubmitOutcome::Skipped
                    }
                }
                ReprocessPolicy::Reset => {
                    slot.context = self.new_context(ticket);
                    slot.pending.clear();
                    self.publish(PipelineEvent::ticket_update(
                        &slot.context,
                        TrackerStatus::Todo,
                        "ticket reset",
                    ));
                    SubmitOutcome::Reset
                }
            },
            None => {
                let context = self.new_context(ticket);
                self.publish(PipelineEvent::ticket_update(
                    &context,
                    TrackerStatus::Todo,
                    "ticket accepted",
                ));
                slots.insert(
                    ticket_id.clone(),
                    ContextSlot {
                        context,
                        pending: Default::default(),
                    },
                );
                SubmitOutcome::Accepted
            }
        };
        drop(slots);

        match outcome {
            SubmitOutcome::Skipped => debug!(ticket = %ticket_id, "Duplicate ticket skipped"),
            other => info!(ticket = %ticket_id, outcome = ?other, "Ticket submitted"),
        }
        self.wake.notify_one();
        outcome
    }

    fn new_context(&self, ticket: Ticket) -> PipelineContext {
        let score = self.scorer.score(&ticket);
        let complexity = self.estimator.estimate(&ticket);
        PipelineContext::new(ticket, score, complexity)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub async fn context(&self, ticket_id: &str) -> Option<PipelineContext> {
        self.store.get(ticket_id).await
    }

    /// Every context, in priority order.
    pub async fn contexts(&self) -> Vec<PipelineContext> {
        self.store.list().await
    }

    pub async fn summary(&self, ticket_id: &str) -> Option<PipelineSummary> {
        self.store.get(ticket_id).await.map(|ctx| ctx.summary())
    }

    pub async fn summaries(&self) -> Vec<PipelineSummary> {
        self.store
            .list()
            .await
            .iter()
            .map(PipelineContext::summary)
            .collect()
    }

    pub fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.resources.breakers.snapshots()
    }

    pub fn registry_entries(&self) -> Vec<AgentRegistryEntry> {
        self.resources.registry.snapshots()
    }

    /// Whether every context is terminal or frozen.
    pub async fn is_settled(&self) -> bool {
        self.store
            .list()
            .await
            .iter()
            .all(|ctx| ctx.in_flight().is_none() && (ctx.is_terminal() || ctx.is_frozen()))
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Re-arm a halted, frozen or waiting ticket at its stage with a fresh
    /// attempt budget.
    pub async fn retry(&self, ticket_id: &str) -> EngineResult<CommandOutcome> {
        self.command(ticket_id, Command::Retry).await
    }

    /// Force a ticket to `escalated`.
    pub async fn escalate(&self, ticket_id: &str) -> EngineResult<CommandOutcome> {
        self.command(ticket_id, Command::Escalate).await
    }

    /// Flip a stage's enabled flag. Returns the new value.
    pub fn toggle(&self, stage: Stage) -> EngineResult<bool> {
        let enabled = self.resources.registry.toggle(stage)?;
        self.wake.notify_one();
        Ok(enabled)
    }

    async fn command(&self, ticket_id: &str, command: Command) -> EngineResult<CommandOutcome> {
        let outcome = self
            .store
            .update(ticket_id, |slot| {
                if slot.context.in_flight().is_some() {
                    slot.pending.push_back(command);
                    info!(ticket = %ticket_id, %command, "Command queued behind in-flight attempt");
                    return Ok(CommandOutcome::Queued);
                }
                self.apply_command(&mut slot.context, command)
                    .map(|()| CommandOutcome::Applied)
                    .map_err(|source| EngineError::Transition {
                        ticket_id: ticket_id.to_string(),
                        source,
                    })
            })
            .await
            .ok_or_else(|| EngineError::UnknownTicket(ticket_id.to_string()))??;
        self.wake.notify_one();
        Ok(outcome)
    }

    fn apply_command(
        &self,
        ctx: &mut PipelineContext,
        command: Command,
    ) -> Result<(), TransitionError> {
        match command {
            Command::Retry => {
                let stage = ctx.rearm("retry command")?;
                info!(ticket = %ctx.ticket_id(), stage = %stage, "Retry command applied");
                self.publish_update(ctx, format!("retry: re-armed at {stage}"));
            }
            Command::Escalate => {
                if ctx.is_terminal() {
                    return Err(TransitionError::Terminal(ctx.current_stage()));
                }
                let decision = self.escalation.decide(
                    ctx.recent_failures(self.escalation.config().failure_window),
                    EscalationTrigger::Manual,
                );
                ctx.terminate(decision.outcome, &decision.reason)?;
                info!(ticket = %ctx.ticket_id(), "Escalate command applied");
                self.publish_update(ctx, decision.reason.clone());
                self.publish(PipelineEvent::system_alert(
                    AlertSeverity::Warning,
                    Some(ctx.ticket_id().to_string()),
                    format!("Ticket {} escalated: {}", ctx.ticket().tracker_id, decision.reason),
                ));
            }
        }
        Ok(())
    }

    // ── Scheduling ──────────────────────────────────────────────────────

    /// Start as many ready attempts as the caps allow. Returns how many
    /// were spawned onto `workers`.
    pub async fn dispatch_ready(self: &Arc<Self>, workers: &mut JoinSet<()>) -> usize {
        let ready = self.store.ready(Instant::now()).await;
        let mut started = 0;

        for (ticket_id, stage) in ready {
            if !self.resources.registry.is_enabled(stage) {
                debug!(ticket = %ticket_id, stage = %stage, "Stage disabled; ticket stays queued");
                continue;
            }
            if let Some(dependency) = self.trial_pending(stage) {
                debug!(ticket = %ticket_id, %dependency, "Breaker trial in flight; ticket stays queued");
                continue;
            }
            let Ok(global) = self.global.clone().try_acquire_owned() else {
                debug!("Global concurrency cap reached");
                break;
            };
            let dependency_permit = match self.dependency_permit(stage) {
                Ok(permit) => permit,
                Err(dependency) => {
                    debug!(ticket = %ticket_id, %dependency, "Dependency concurrency cap reached");
                    continue;
                }
            };

            let claimed = self
                .store
                .update(&ticket_id, |slot| {
                    let ctx = &mut slot.context;
                    if !ctx.is_ready(Instant::now()) || ctx.current_stage() != stage {
                        return None;
                    }
                    match ctx.begin_attempt() {
                        Ok((stage, attempt)) => {
                            self.publish_update(ctx, format!("{stage} started (attempt {attempt})"));
                            Some((attempt, ctx.clone()))
                        }
                        Err(e) => {
                            warn!(ticket = %ticket_id, error = %e, "Could not claim ticket");
                            None
                        }
                    }
                })
                .await
                .flatten();
            let Some((attempt, snapshot)) = claimed else {
                continue;
            };

            info!(ticket = %ticket_id, stage = %stage, attempt, "Dispatching stage");
            self.resources.registry.begin(stage);
            started += 1;

            let this = Arc::clone(self);
            workers.spawn(async move {
                let _permits = (global, dependency_permit);
                this.execute_stage(snapshot, stage, attempt).await;
            });
        }
        started
    }

    /// Dependency of `stage` whose half-open trial is still running. Other
    /// callers wait for the trial instead of spending circuit waits on it.
    fn trial_pending(&self, stage: Stage) -> Option<Dependency> {
        let dependency = HandlerKind::for_stage(stage)?.dependency();
        self.resources
            .breakers
            .get(dependency)
            .filter(|breaker| breaker.trial_in_flight())
            .map(|_| dependency)
    }

    fn dependency_permit(&self, stage: Stage) -> Result<Option<OwnedSemaphorePermit>, Dependency> {
        let Some(kind) = HandlerKind::for_stage(stage) else {
            return Ok(None);
        };
        let dependency = kind.dependency();
        match self.per_dependency.get(&dependency) {
            Some(sem) => sem
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| dependency),
            None => Ok(None),
        }
    }

    // ── Execution ───────────────────────────────────────────────────────

    async fn execute_stage(&self, snapshot: PipelineContext, stage: Stage, attempt: u32) {
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = match HandlerKind::for_stage(stage) {
            Some(kind) => self.run_handler(kind, &snapshot).await,
            None => self.run_intake(&snapshot),
        };
        let result = self.apply_gate(stage, result);
        let duration = clock.elapsed();

        match &result {
            AttemptResult::Failure {
                error: StageError::CircuitOpen { .. },
                ..
            } => self.resources.registry.abandon(stage),
            AttemptResult::Success(_) => self.resources.registry.finish(stage, true, duration),
            AttemptResult::Failure { .. } => self.resources.registry.finish(stage, false, duration),
        }

        let timing = AttemptTiming {
            attempt,
            started_at,
            duration,
        };
        self.complete_attempt(snapshot.ticket_id(), stage, timing, result)
            .await;
    }

    /// Intake runs in-core: validate the ticket and record the assessment.
    fn run_intake(&self, ctx: &PipelineContext) -> StageResult {
        let ticket = ctx.ticket();
        if ticket.id.trim().is_empty() {
            return Err(StageError::validation("ticket id is empty"));
        }
        if ticket.title.trim().is_empty() {
            return Err(StageError::validation("ticket title is empty"));
        }

        let breakdown = self.scorer.explain(ticket);
        let complexity = self.estimator.estimate(ticket);
        Ok(StageOutput::new(format!(
            "score {:.2}, complexity {complexity}",
            breakdown.score
        ))
        .with_data(json!({
            "priority_score": breakdown.score,
            "complexity": complexity,
            "matched_keyword": breakdown.matched_keyword,
            "has_error_trace": ticket.has_error_trace(),
        })))
    }

    /// Run an external handler under its dependency's breaker. A panicking
    /// handler is reported as a fatal error.
    async fn run_handler(&self, kind: HandlerKind, ctx: &PipelineContext) -> StageResult {
        let dependency = kind.dependency();
        let Some(breaker) = self.resources.breakers.get(dependency) else {
            return Err(StageError::fatal(format!("no breaker for {dependency}")));
        };
        let handler = self.handlers.get(kind);

        breaker
            .call(|| async move {
                AssertUnwindSafe(handler.execute(ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(StageError::fatal(format!(
                            "{kind} handler panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    })
            })
            .await
    }

    /// Development only succeeds with a patch that passes the gate.
    fn apply_gate(&self, stage: Stage, result: StageResult) -> AttemptResult {
        match result {
            Ok(mut output) if stage == Stage::Development => match output.patch.take() {
                Some(patch) => match self.gate.rejection(&patch) {
                    None => AttemptResult::Success(output.with_patch(patch)),
                    Some(reason) => AttemptResult::Failure {
                        error: StageError::validation(reason),
                        rejected_patch: Some(patch),
                    },
                },
                None => AttemptResult::Failure {
                    error: StageError::validation("development produced no patch"),
                    rejected_patch: None,
                },
            },
            Ok(output) => AttemptResult::Success(output),
            Err(error) => AttemptResult::Failure {
                error,
                rejected_patch: None,
            },
        }
    }

    async fn complete_attempt(
        &self,
        ticket_id: &str,
        stage: Stage,
        timing: AttemptTiming,
        result: AttemptResult,
    ) {
        let settled = self
            .store
            .update(ticket_id, |slot| {
                self.apply_result(&mut slot.context, stage, timing, result);
                while let Some(command) = slot.pending.pop_front() {
                    if let Err(e) = self.apply_command(&mut slot.context, command) {
                        warn!(ticket = %ticket_id, %command, error = %e, "Queued command rejected");
                    }
                }
            })
            .await;
        if settled.is_none() {
            warn!(ticket = %ticket_id, "Context disappeared while in flight");
        }
        self.wake.notify_one();
    }

    fn apply_result(
        &self,
        ctx: &mut PipelineContext,
        stage: Stage,
        timing: AttemptTiming,
        result: AttemptResult,
    ) {
        match result {
            AttemptResult::Success(output) => match ctx.record_success(timing, output) {
                Ok(next) => {
                    if stage == Stage::Development {
                        ctx.set_publish_decision(self.gate.decide(ctx.patch_attempts()));
                    }
                    info!(ticket = %ctx.ticket_id(), from = %stage, to = %next, "Stage succeeded");
                    self.publish_update(ctx, format!("{stage} succeeded"));
                }
                Err(e) => self.freeze(ctx, &format!("invariant violation: {e}")),
            },
            AttemptResult::Failure {
                error,
                rejected_patch,
            } => {
                let low_confidence = rejected_patch.as_ref().is_some_and(|p| p.success);
                if let Some(patch) = rejected_patch {
                    ctx.record_patch(patch);
                }
                if let Err(e) = ctx.record_failure(timing, &error) {
                    self.freeze(ctx, &format!("invariant violation: {e}"));
                    return;
                }
                self.route_failure(ctx, stage, timing.attempt, &error, low_confidence);
            }
        }
    }

    fn route_failure(
        &self,
        ctx: &mut PipelineContext,
        stage: Stage,
        attempt: u32,
        error: &StageError,
        low_confidence: bool,
    ) {
        let policy = &self.config.retry;
        match error {
            StageError::Fatal(message) => {
                self.freeze(ctx, message);
            }
            StageError::CircuitOpen {
                dependency,
                retry_after,
            } => {
                let waits = ctx.circuit_waits().saturating_sub(1);
                match policy.on_circuit_open(ctx.current_attempt(), waits, *retry_after) {
                    RetryDecision::Retry { delay, .. } => {
                        ctx.schedule_resume(delay);
                        info!(
                            ticket = %ctx.ticket_id(),
                            stage = %stage,
                            %dependency,
                            delay_ms = delay.as_millis() as u64,
                            "Dependency isolated; waiting for breaker"
                        );
                        self.publish_update(
                            ctx,
                            format!("{dependency} unavailable; waiting {}ms", delay.as_millis()),
                        );
                    }
                    _ => self.halt(ctx, EscalationTrigger::CircuitWaitsExhausted),
                }
            }
            StageError::Transient(message) => {
                match policy.on_failure(attempt, error.kind()) {
                    RetryDecision::Retry {
                        next_attempt,
                        delay,
                    } => {
                        ctx.schedule_resume(delay);
                        info!(
                            ticket = %ctx.ticket_id(),
                            stage = %stage,
                            attempt,
                            next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Transient failure; retry scheduled"
                        );
                        self.publish_update(
                            ctx,
                            format!(
                                "{stage} attempt {attempt} failed ({message}); retry in {}ms",
                                delay.as_millis()
                            ),
                        );
                    }
                    RetryDecision::Exhausted { attempts } => {
                        warn!(ticket = %ctx.ticket_id(), stage = %stage, attempts, "Retries exhausted");
                        self.halt(ctx, EscalationTrigger::RetriesExhausted);
                    }
                    RetryDecision::NotRetriable { .. } => {
                        self.halt(ctx, EscalationTrigger::Validation)
                    }
                }
            }
            StageError::Validation(message) => {
                debug!(ticket = %ctx.ticket_id(), stage = %stage, %message, "Validation failure");
                let trigger = if low_confidence {
                    EscalationTrigger::LowConfidence
                } else {
                    EscalationTrigger::Validation
                };
                self.halt(ctx, trigger);
            }
        }
    }

    fn halt(&self, ctx: &mut PipelineContext, trigger: EscalationTrigger) {
        let decision = self.escalation.decide(
            ctx.recent_failures(self.escalation.config().failure_window),
            trigger,
        );
        if let Err(e) = ctx.terminate(decision.outcome, &decision.reason) {
            self.freeze(ctx, &format!("invariant violation: {e}"));
            return;
        }

        warn!(
            ticket = %ctx.ticket_id(),
            outcome = %decision.outcome,
            reason = %decision.reason,
            "Ticket halted"
        );
        self.publish_update(ctx, decision.reason.clone());
        let message = if decision.retry_later {
            format!(
                "Ticket {} failed, retry later: {}",
                ctx.ticket().tracker_id,
                decision.reason
            )
        } else {
            format!(
                "Ticket {} escalated for human review: {}",
                ctx.ticket().tracker_id,
                decision.reason
            )
        };
        self.publish(PipelineEvent::system_alert(
            AlertSeverity::Warning,
            Some(ctx.ticket_id().to_string()),
            message,
        ));
    }

    fn freeze(&self, ctx: &mut PipelineContext, reason: &str) {
        error!(ticket = %ctx.ticket_id(), stage = %ctx.current_stage(), %reason, "Context frozen");
        ctx.freeze(reason);
        self.publish_update(ctx, format!("frozen: {reason}"));
        self.publish(PipelineEvent::system_alert(
            AlertSeverity::Critical,
            Some(ctx.ticket_id().to_string()),
            format!("Ticket {} frozen: {reason}", ctx.ticket().tracker_id),
        ));
    }

    // ── Run loop ────────────────────────────────────────────────────────

    /// Drop terminal contexts past their retention age.
    pub async fn prune(&self) -> usize {
        let max_age = i64::try_from(self.config.dispatch.max_context_age_secs).unwrap_or(i64::MAX);
        let removed = self
            .store
            .prune_terminal(chrono::Duration::seconds(max_age))
            .await;
        if removed > 0 {
            info!(removed, "Pruned terminal contexts");
        }
        removed
    }

    /// Schedule until `shutdown` fires, then wait for in-flight attempts.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        let idle = Duration::from_millis(self.config.dispatch.idle_poll_ms.max(1));
        let cleanup_every = Duration::from_secs(self.config.dispatch.cleanup_interval_secs.max(1));
        let mut cleanup = tokio::time::interval_at(Instant::now() + cleanup_every, cleanup_every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            global = self.config.dispatch.global_concurrency,
            per_dependency = self.config.dispatch.dependency_concurrency,
            "Dispatcher started"
        );

        loop {
            self.dispatch_ready(&mut workers).await;

            let idle_at = Instant::now() + idle;
            let wake_at = match self.store.next_deadline().await {
                Some(deadline) => deadline.min(idle_at),
                None => idle_at,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Stage worker failed");
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = cleanup.tick() => {
                    self.prune().await;
                }
            }
        }

        info!(in_flight = workers.len(), "Dispatcher stopping; draining workers");
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Stage worker failed");
            }
        }
        info!("Dispatcher stopped");
    }
}
