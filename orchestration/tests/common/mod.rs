//! Shared fixtures for the orchestration integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestration::{
    PatchAttempt, PipelineContext, ReportedPriority, SharedDispatcher, StageExecutor, StageHandlers,
    StageOutput, StageResult, Ticket,
};
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Executor backed by a closure over the context snapshot.
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F> StageExecutor for FnExecutor<F>
where
    F: Fn(&PipelineContext) -> StageResult + Send + Sync,
{
    async fn execute(&self, context: &PipelineContext) -> StageResult {
        (self.0)(context)
    }
}

pub fn executor<F>(f: F) -> Arc<dyn StageExecutor>
where
    F: Fn(&PipelineContext) -> StageResult + Send + Sync + 'static,
{
    Arc::new(FnExecutor(f))
}

pub fn succeed(summary: &'static str) -> Arc<dyn StageExecutor> {
    executor(move |_| Ok(StageOutput::new(summary)))
}

pub fn patch(confidence: f64) -> Arc<dyn StageExecutor> {
    executor(move |ctx| {
        Ok(StageOutput::new("patch generated").with_patch(PatchAttempt::new(
            format!("src/{}.rs", ctx.ticket_id()),
            "--- a\n+++ b",
            confidence,
        )))
    })
}

/// Executor that blocks until the gate is opened.
pub struct Gated {
    pub gate: Arc<Notify>,
}

#[async_trait]
impl StageExecutor for Gated {
    async fn execute(&self, _context: &PipelineContext) -> StageResult {
        self.gate.notified().await;
        Ok(StageOutput::new("released"))
    }
}

pub fn handlers(
    planner: Arc<dyn StageExecutor>,
    developer: Arc<dyn StageExecutor>,
) -> StageHandlers {
    StageHandlers::new(planner, developer, succeed("tests pass"), succeed("pull request opened"))
}

pub fn ticket(id: &str, priority: ReportedPriority) -> Ticket {
    Ticket::new(
        format!("PROJ-{id}"),
        format!("Defect {id}"),
        "Button label is wrong",
        priority,
    )
    .with_id(id)
}

/// Dispatch and join workers until nothing more is ready right now.
pub async fn drive(dispatcher: &SharedDispatcher) {
    let mut workers = JoinSet::new();
    loop {
        dispatcher.dispatch_ready(&mut workers).await;
        if workers.join_next().await.is_none() {
            break;
        }
    }
}

/// Poll until every context is terminal or frozen.
pub async fn wait_until_settled(dispatcher: &SharedDispatcher) {
    while !dispatcher.is_settled().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
