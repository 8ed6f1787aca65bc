//! Stage executors backed by an HTTP agent service.
//!
//! Each handler POSTs the context snapshot to `{base}/stages/{handler}` and
//! expects a `StageOutput` JSON body back. HTTP outcomes map onto the
//! engine's failure taxonomy:
//!
//! | Response                       | StageError  |
//! |--------------------------------|-------------|
//! | connect / timeout / 5xx / 429  | Transient   |
//! | 503 with `Retry-After`         | CircuitOpen |
//! | other 4xx, unparseable body    | Validation  |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestration::{
    HandlerKind, PipelineContext, StageError, StageExecutor, StageHandlers, StageOutput,
    StageResult,
};
use reqwest::StatusCode;
use tracing::debug;

/// One handler kind served by the agent service.
pub struct HttpStageExecutor {
    kind: HandlerKind,
    url: String,
    http: reqwest::Client,
}

impl HttpStageExecutor {
    pub fn new(base_url: &str, kind: HandlerKind, http: reqwest::Client) -> Self {
        Self {
            kind,
            url: format!("{}/stages/{}", base_url.trim_end_matches('/'), kind.name()),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Seconds from a `Retry-After` header, if present and numeric.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success status to the failure taxonomy.
pub fn classify_status(
    kind: HandlerKind,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> StageError {
    match (status, retry_after) {
        (StatusCode::SERVICE_UNAVAILABLE, Some(retry_after)) => StageError::CircuitOpen {
            dependency: kind.dependency(),
            retry_after,
        },
        (s, _) if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            StageError::transient(format!("{kind} service returned {s}"))
        }
        (s, _) => StageError::validation(format!("{kind} service rejected the request ({s}): {body}")),
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    async fn execute(&self, context: &PipelineContext) -> StageResult {
        debug!(handler = %self.kind, ticket = %context.ticket_id(), url = %self.url, "Calling agent service");
        let response = self
            .http
            .post(&self.url)
            .json(context)
            .send()
            .await
            .map_err(|e| StageError::transient(format!("{} service unreachable: {e}", self.kind)))?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.kind, status, wait, &body));
        }

        response.json::<StageOutput>().await.map_err(|e| {
            StageError::validation(format!("{} service returned malformed output: {e}", self.kind))
        })
    }
}

/// All four handlers pointed at one agent service.
pub fn http_handlers(base_url: &str, timeout: Duration) -> anyhow::Result<StageHandlers> {
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build agent service client: {e}"))?;
    let make = |kind| -> Arc<dyn StageExecutor> {
        Arc::new(HttpStageExecutor::new(base_url, kind, http.clone()))
    };
    Ok(StageHandlers::new(
        make(HandlerKind::Planner),
        make(HandlerKind::Developer),
        make(HandlerKind::Qa),
        make(HandlerKind::Communicator),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::{Dependency, FailureKind, ReportedPriority, Ticket};

    #[test]
    fn test_url_per_handler() {
        let exec = HttpStageExecutor::new("http://agents:9000/", HandlerKind::Qa, reqwest::Client::new());
        assert_eq!(exec.url(), "http://agents:9000/stages/qa");
    }

    #[test]
    fn test_status_classification() {
        let kind = HandlerKind::Communicator;
        let busy = classify_status(kind, StatusCode::SERVICE_UNAVAILABLE, Some(Duration::from_secs(20)), "");
        assert!(matches!(
            busy,
            StageError::CircuitOpen {
                dependency: Dependency::CodeHost,
                ..
            }
        ));
        assert_eq!(
            classify_status(kind, StatusCode::SERVICE_UNAVAILABLE, None, "").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            classify_status(kind, StatusCode::TOO_MANY_REQUESTS, None, "").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            classify_status(kind, StatusCode::UNPROCESSABLE_ENTITY, None, "bad diff").kind(),
            FailureKind::Validation
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        let exec = HttpStageExecutor::new(
            "http://127.0.0.1:9",
            HandlerKind::Planner,
            reqwest::Client::new(),
        );
        let ctx = PipelineContext::new(
            Ticket::new("PROJ-1", "t", "d", ReportedPriority::Low),
            0.2,
            orchestration::ComplexityClass::High,
        );
        let err = exec.execute(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }
}
