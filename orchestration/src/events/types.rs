//! Event types for pipeline notifications
//!
//! These events feed dashboards, logs and the tracker sync. They are
//! fire-and-forget; consumers must tolerate gaps.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::Stage;
use crate::ticket::{TicketId, TrackerStatus};

/// All pipeline notifications
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A pipeline context changed (stage started, advanced, retried, halted)
    TicketUpdate {
        ticket_id: TicketId,
        tracker_id: String,
        stage: Stage,
        status: TrackerStatus,
        attempt: u32,
        priority_score: f64,
        checkpoints: Vec<Stage>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A dependency breaker changed state, or a stage type was toggled
    AgentStatus {
        component: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Policy-level alert: escalation, isolation, frozen context
    SystemAlert {
        severity: AlertSeverity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticket_id: Option<TicketId>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Snapshot of a context after a transition.
    pub fn ticket_update(
        context: &PipelineContext,
        status: TrackerStatus,
        message: impl Into<String>,
    ) -> Self {
        PipelineEvent::TicketUpdate {
            ticket_id: context.ticket_id().to_string(),
            tracker_id: context.ticket().tracker_id.clone(),
            stage: context.current_stage(),
            status,
            attempt: context.current_attempt(),
            priority_score: context.priority_score(),
            checkpoints: context.checkpoints().to_vec(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent_status(
        component: impl Into<String>,
        status: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        PipelineEvent::AgentStatus {
            component: component.into(),
            status: status.into(),
            detail,
            timestamp: Utc::now(),
        }
    }

    pub fn system_alert(
        severity: AlertSeverity,
        ticket_id: Option<TicketId>,
        message: impl Into<String>,
    ) -> Self {
        PipelineEvent::SystemAlert {
            severity,
            ticket_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::TicketUpdate { timestamp, .. } => *timestamp,
            PipelineEvent::AgentStatus { timestamp, .. } => *timestamp,
            PipelineEvent::SystemAlert { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::TicketUpdate { .. } => "ticket_update",
            PipelineEvent::AgentStatus { .. } => "agent_status",
            PipelineEvent::SystemAlert { .. } => "system_alert",
        }
    }

    /// Get the ticket ID if this event is ticket-scoped
    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::TicketUpdate { ticket_id, .. } => Some(ticket_id),
            PipelineEvent::SystemAlert { ticket_id, .. } => ticket_id.as_deref(),
            PipelineEvent::AgentStatus { .. } => None,
        }
    }
}

/// Severity of a system alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PipelineEvent::system_alert(
            AlertSeverity::Critical,
            Some("t-1".into()),
            "context frozen",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "system_alert");
        assert_eq!(json["severity"], "critical");
        assert_eq!(event.ticket_id(), Some("t-1"));
    }

    #[test]
    fn test_agent_status_roundtrip() {
        let event = PipelineEvent::agent_status("language_model", "open", None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("detail"));
        let restored: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.event_type(), "agent_status");
        assert!(restored.ticket_id().is_none());
    }

    #[test]
    fn test_ticket_update_shape() {
        let event = PipelineEvent::TicketUpdate {
            ticket_id: "t-2".into(),
            tracker_id: "PROJ-2".into(),
            stage: Stage::Qa,
            status: TrackerStatus::Testing,
            attempt: 1,
            priority_score: 0.8,
            checkpoints: vec![Stage::Intake, Stage::Planning, Stage::Development],
            message: "stage started".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ticket_update");
        assert_eq!(json["stage"], "qa");
        assert_eq!(json["status"], "testing");
        assert_eq!(json["checkpoints"][2], "development");
    }
}
