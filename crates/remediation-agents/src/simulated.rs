//! Scripted stage executors for the demo and for tests.
//!
//! Each executor plays back a per-ticket script of steps and falls back to
//! a default step once the script runs out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use orchestration::{
    HandlerKind, PatchAttempt, PipelineContext, ReportedPriority, Stage, StageError,
    StageExecutor, StageHandlers, StageOutput, StageResult, Ticket,
};
use serde_json::json;

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Succeed with a stage-appropriate output.
    Succeed,
    /// Produce a patch with this confidence (development only).
    Patch(f64),
    Transient(String),
    Validation(String),
    /// Report the dependency as unavailable for this long.
    Unavailable(Duration),
}

pub struct ScriptedExecutor {
    kind: HandlerKind,
    latency: Duration,
    default_step: Step,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
}

impl ScriptedExecutor {
    pub fn new(kind: HandlerKind) -> Self {
        let default_step = match kind {
            HandlerKind::Developer => Step::Patch(0.85),
            _ => Step::Succeed,
        };
        Self {
            kind,
            latency: Duration::from_millis(50),
            default_step,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_default(mut self, step: Step) -> Self {
        self.default_step = step;
        self
    }

    /// Queue steps for a ticket, played back in order.
    pub fn script(mut self, ticket_id: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(ticket_id.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn shared(self) -> Arc<dyn StageExecutor> {
        Arc::new(self)
    }

    fn next_step(&self, ticket_id: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts
            .get_mut(ticket_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_step.clone())
    }

    fn output(&self, ctx: &PipelineContext, confidence: Option<f64>) -> StageOutput {
        let ticket = ctx.ticket();
        let slug = ticket.tracker_id.to_lowercase().replace('-', "_");
        match self.kind {
            HandlerKind::Planner => StageOutput::new(format!("plan for {}", ticket.tracker_id))
                .with_data(json!({
                    "target_file": format!("src/{slug}.rs"),
                    "complexity": ctx.complexity(),
                })),
            HandlerKind::Developer => {
                let target = ctx
                    .stage_data(Stage::Planning)
                    .and_then(|plan| plan["target_file"].as_str())
                    .unwrap_or("src/lib.rs")
                    .to_string();
                let patch = PatchAttempt::new(
                    target.clone(),
                    format!("--- a/{target}\n+++ b/{target}\n@@ fix: {} @@", ticket.title),
                    confidence.unwrap_or(0.85),
                )
                .with_test_content(format!("#[test]\nfn regression_{slug}() {{}}"));
                StageOutput::new(format!("patched {target}")).with_patch(patch)
            }
            HandlerKind::Qa => {
                StageOutput::new("all tests pass").with_data(json!({ "tests_run": 12 }))
            }
            HandlerKind::Communicator => {
                let decision = ctx
                    .publish_decision()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "manual_review".into());
                StageOutput::new(format!("published ({decision})")).with_data(json!({
                    "decision": decision,
                    "published_at": Utc::now().to_rfc3339(),
                }))
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, context: &PipelineContext) -> StageResult {
        tokio::time::sleep(self.latency).await;
        match self.next_step(context.ticket_id()) {
            Step::Succeed => Ok(self.output(context, None)),
            Step::Patch(confidence) => Ok(self.output(context, Some(confidence))),
            Step::Transient(message) => Err(StageError::transient(message)),
            Step::Validation(message) => Err(StageError::validation(message)),
            Step::Unavailable(retry_after) => Err(StageError::CircuitOpen {
                dependency: self.kind.dependency(),
                retry_after,
            }),
        }
    }
}

/// Handlers and tickets for the demo run.
pub struct DemoScenario {
    pub handlers: StageHandlers,
    pub tickets: Vec<Ticket>,
}

/// Four tickets exercising ordering, backoff, the confidence gate and a
/// code-host outage.
pub fn demo_scenario() -> DemoScenario {
    let now = Utc::now();
    let tickets = vec![
        Ticket::new(
            "DEMO-1",
            "Settings label typo",
            "The label on the settings page is misspelled",
            ReportedPriority::Low,
        )
        .with_id("demo-typo")
        .with_created_at(now - chrono::Duration::hours(2)),
        Ticket::new(
            "DEMO-2",
            "Checkout outage",
            "Payment service crash on startup after the last deploy; checkout is down for all users",
            ReportedPriority::Critical,
        )
        .with_id("demo-outage")
        .with_error_trace("thread 'main' panicked at 'pool exhausted', src/payments/pool.rs:88:9"),
        Ticket::new(
            "DEMO-3",
            "Export produces empty CSV",
            "Exporting a report with more than 1000 rows produces an empty file. The bug spans multiple files in the export pipeline.",
            ReportedPriority::High,
        )
        .with_id("demo-export")
        .with_error_trace("ExportError: writer closed before flush"),
        Ticket::new(
            "DEMO-4",
            "Avatar upload fails",
            "Uploading a PNG avatar returns 500",
            ReportedPriority::Medium,
        )
        .with_id("demo-avatar")
        .with_error_trace("upload handler: unexpected EOF"),
    ];

    let developer = ScriptedExecutor::new(HandlerKind::Developer)
        .script(
            "demo-outage",
            [
                Step::Transient("model endpoint timed out".into()),
                Step::Transient("model endpoint timed out".into()),
                Step::Patch(0.82),
            ],
        )
        .script("demo-export", [Step::Patch(0.55)]);
    let communicator = ScriptedExecutor::new(HandlerKind::Communicator).script(
        "demo-avatar",
        [Step::Unavailable(Duration::from_secs(2))],
    );

    DemoScenario {
        handlers: StageHandlers::new(
            ScriptedExecutor::new(HandlerKind::Planner).shared(),
            developer.shared(),
            ScriptedExecutor::new(HandlerKind::Qa).shared(),
            communicator.shared(),
        ),
        tickets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::{ComplexityClass, Dependency, FailureKind};

    fn context(id: &str) -> PipelineContext {
        PipelineContext::new(
            Ticket::new("PROJ-7", "Crash", "d", ReportedPriority::High).with_id(id),
            0.8,
            ComplexityClass::Low,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_plays_back_then_defaults() {
        let exec = ScriptedExecutor::new(HandlerKind::Developer)
            .script("t-1", [Step::Transient("busy".into()), Step::Patch(0.4)]);
        let ctx = context("t-1");

        let first = exec.execute(&ctx).await.unwrap_err();
        assert_eq!(first.kind(), FailureKind::Transient);

        let second = exec.execute(&ctx).await.unwrap();
        assert_eq!(second.patch.unwrap().confidence, 0.4);

        let third = exec.execute(&ctx).await.unwrap();
        assert_eq!(third.patch.unwrap().confidence, 0.85);

        // Scripts are per ticket.
        let other = exec.execute(&context("t-2")).await.unwrap();
        assert!(other.patch.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_reports_handler_dependency() {
        let exec = ScriptedExecutor::new(HandlerKind::Communicator)
            .with_default(Step::Unavailable(Duration::from_secs(3)));
        match exec.execute(&context("t-1")).await {
            Err(StageError::CircuitOpen {
                dependency,
                retry_after,
            }) => {
                assert_eq!(dependency, Dependency::CodeHost);
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_demo_scenario_shape() {
        let scenario = demo_scenario();
        assert_eq!(scenario.tickets.len(), 4);
        assert!(scenario.tickets.iter().any(|t| t.id == "demo-outage"));
    }
}
