//! Breaker isolation, circuit waits and the failed-vs-escalated decision.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orchestration::{
    CircuitState, CommandOutcome, Dependency, Dispatcher, EngineConfig, PipelineEvent,
    ReportedPriority, SharedResources, Stage, StageError, StageOutput,
};

use common::{drive, executor, handlers, patch, succeed, ticket};

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_ticket_for_later_retry() {
    let mut config = EngineConfig::default();
    config.dispatch.global_concurrency = 1;
    config.retry.max_retries = 0;
    config.retry.max_circuit_waits = 0;
    config.breaker.failure_threshold = 2;
    let resources = SharedResources::from_config(&config);
    let mut events = resources.events.subscribe();

    let calls = Arc::new(AtomicU32::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    let planner = {
        let calls = calls.clone();
        let healthy = healthy.clone();
        executor(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if healthy.load(Ordering::SeqCst) {
                Ok(StageOutput::new("plan ready"))
            } else {
                Err(StageError::transient("connection reset by peer"))
            }
        })
    };
    let dispatcher = Dispatcher::new(config, handlers(planner, patch(0.9)), resources)
        .unwrap()
        .shared();

    // Two high-priority tickets trip the breaker before the low one plans.
    dispatcher.submit(ticket("a", ReportedPriority::High)).await;
    dispatcher.submit(ticket("b", ReportedPriority::High)).await;
    dispatcher.submit(ticket("c", ReportedPriority::Low)).await;
    drive(&dispatcher).await;

    for id in ["a", "b"] {
        let ctx = dispatcher.context(id).await.unwrap();
        assert_eq!(ctx.current_stage(), Stage::Escalated, "ticket {id}");
        assert_eq!(ctx.halted_stage(), Some(Stage::Planning));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let c = dispatcher.context("c").await.unwrap();
    assert_eq!(c.current_stage(), Stage::Failed);
    assert_eq!(c.halted_stage(), Some(Stage::Planning));
    assert!(c.annotation().unwrap().contains("retry later"));
    assert_eq!(c.attempts(Stage::Planning), 0);

    let llm = dispatcher
        .breaker_states()
        .into_iter()
        .find(|s| s.dependency == Dependency::LanguageModel)
        .unwrap();
    assert_eq!(llm.state, CircuitState::Open);

    let mut isolated = false;
    let mut retry_later_alert = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::AgentStatus {
                component, status, ..
            } if component == "language_model" && status == "open" => isolated = true,
            PipelineEvent::SystemAlert {
                ticket_id: Some(id),
                message,
                ..
            } if id == "c" => retry_later_alert = message.contains("retry later"),
            _ => {}
        }
    }
    assert!(isolated);
    assert!(retry_later_alert);

    // Once the reset timeout has passed and the dependency recovers, a
    // retry command runs the trial call and closes the circuit.
    tokio::time::advance(Duration::from_secs(31)).await;
    healthy.store(true, Ordering::SeqCst);
    assert_eq!(dispatcher.retry("c").await.unwrap(), CommandOutcome::Applied);
    drive(&dispatcher).await;

    let c = dispatcher.context("c").await.unwrap();
    assert_eq!(c.current_stage(), Stage::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let llm = dispatcher
        .breaker_states()
        .into_iter()
        .find(|s| s.dependency == Dependency::LanguageModel)
        .unwrap();
    assert_eq!(llm.state, CircuitState::Closed);
    assert_eq!(llm.consecutive_failures, 0);

    // Escalated tickets were not touched by the retry.
    assert_eq!(
        dispatcher.context("a").await.unwrap().current_stage(),
        Stage::Escalated
    );
}

#[tokio::test(start_paused = true)]
async fn test_handler_reported_circuit_open_waits_without_consuming_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let communicator = {
        let calls = calls.clone();
        executor(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StageError::CircuitOpen {
                    dependency: Dependency::CodeHost,
                    retry_after: Duration::from_secs(5),
                })
            } else {
                Ok(StageOutput::new("pull request opened"))
            }
        })
    };
    let handlers = orchestration::StageHandlers::new(
        succeed("plan ready"),
        patch(0.9),
        succeed("tests pass"),
        communicator,
    );
    let config = EngineConfig::default();
    let resources = SharedResources::from_config(&config);
    let mut events = resources.events.subscribe();
    let dispatcher = Dispatcher::new(config, handlers, resources)
        .unwrap()
        .shared();

    dispatcher.submit(ticket("t-1", ReportedPriority::Medium)).await;
    drive(&dispatcher).await;

    let ctx = dispatcher.context("t-1").await.unwrap();
    assert_eq!(ctx.current_stage(), Stage::Communication);
    assert!(ctx.resume_at().is_some());
    assert_eq!(ctx.circuit_waits(), 1);
    assert_eq!(ctx.attempts(Stage::Communication), 0);
    assert!(!dispatcher.is_settled().await);

    tokio::time::advance(Duration::from_secs(5)).await;
    drive(&dispatcher).await;

    let ctx = dispatcher.context("t-1").await.unwrap();
    assert_eq!(ctx.current_stage(), Stage::Completed);
    assert_eq!(ctx.circuit_waits(), 0);
    let communication: Vec<u32> = ctx
        .records()
        .iter()
        .filter(|r| r.stage == Stage::Communication)
        .map(|r| r.attempt)
        .collect();
    assert_eq!(communication, vec![1, 1]);
    assert_eq!(ctx.outcome_counts().circuit_open, 1);

    // A handler-reported outage does not count against the breaker.
    let code_host = dispatcher
        .breaker_states()
        .into_iter()
        .find(|s| s.dependency == Dependency::CodeHost)
        .unwrap();
    assert_eq!(code_host.state, CircuitState::Closed);

    let mut waited = false;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::TicketUpdate { message, .. } = event {
            waited |= message == "code_host unavailable; waiting 5000ms";
        }
    }
    assert!(waited);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_transient_retries_escalate() {
    let mut config = EngineConfig::default();
    config.retry.max_retries = 2;
    let calls = Arc::new(AtomicU32::new(0));
    let qa = {
        let calls = calls.clone();
        executor(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StageError::transient("test runner timed out"))
        })
    };
    let handlers = orchestration::StageHandlers::new(
        succeed("plan ready"),
        patch(0.9),
        qa,
        succeed("pull request opened"),
    );
    let resources = SharedResources::from_config(&config);
    let dispatcher = Dispatcher::new(config, handlers, resources)
        .unwrap()
        .shared();

    dispatcher.submit(ticket("t-1", ReportedPriority::High)).await;
    drive(&dispatcher).await;
    tokio::time::advance(Duration::from_secs(1)).await;
    drive(&dispatcher).await;
    tokio::time::advance(Duration::from_secs(2)).await;
    drive(&dispatcher).await;

    let ctx = dispatcher.context("t-1").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.current_stage(), Stage::Escalated);
    assert_eq!(ctx.halted_stage(), Some(Stage::Qa));
    assert_eq!(ctx.attempts(Stage::Qa), 3);
    assert!(ctx.annotation().unwrap().starts_with("retries exhausted"));
    assert_eq!(ctx.outcome_counts().transient, 3);
}

/// Planner whose first call for ticket `a` fails and whose later calls for
/// `a` take ten seconds. Every other ticket plans at once.
struct SlowRecovery {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl orchestration::StageExecutor for SlowRecovery {
    async fn execute(&self, context: &orchestration::PipelineContext) -> orchestration::StageResult {
        if context.ticket_id() != "a" {
            return Ok(StageOutput::new("plan ready"));
        }
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(StageError::transient("connection reset by peer"));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(StageOutput::new("plan ready"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_half_open_trial_does_not_fail_waiting_tickets() {
    let mut config = EngineConfig::default();
    config.breaker.failure_threshold = 1;
    config.breaker.reset_timeout_ms = 1_000;
    let resources = SharedResources::from_config(&config);
    let planner = Arc::new(SlowRecovery {
        calls: AtomicU32::new(0),
    });
    let dispatcher = Dispatcher::new(config, handlers(planner, patch(0.9)), resources)
        .unwrap()
        .shared();

    // `a` trips the breaker before `b` arrives.
    dispatcher.submit(ticket("a", ReportedPriority::High)).await;
    drive(&dispatcher).await;
    let llm = dispatcher
        .breaker_states()
        .into_iter()
        .find(|s| s.dependency == Dependency::LanguageModel)
        .unwrap();
    assert_eq!(llm.state, CircuitState::Open);

    dispatcher.submit(ticket("b", ReportedPriority::Low)).await;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let scheduler = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
    common::wait_until_settled(&dispatcher).await;
    shutdown.cancel();
    scheduler.await.unwrap();

    for id in ["a", "b"] {
        let ctx = dispatcher.context(id).await.unwrap();
        assert_eq!(ctx.current_stage(), Stage::Completed, "ticket {id}");
    }
    // `b` waited for the trial instead of burning its circuit waits.
    let b = dispatcher.context("b").await.unwrap();
    assert!(b.outcome_counts().circuit_open <= 2);
    assert!(b.annotation().is_none());
}
