//! Ticket inputs, patch attempts and tracker-facing status values.
//!
//! A [`Ticket`] is owned by the intake boundary and never mutated by the
//! engine. [`PatchAttempt`]s are produced by the development stage and are
//! immutable once recorded on a pipeline context.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Engine-side ticket identifier.
pub type TicketId = String;

/// Priority as reported by the ticket tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReportedPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ReportedPriority {
    /// Key used in the configurable weight map.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for ReportedPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReportedPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "highest" | "blocker" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" | "normal" => Ok(Self::Medium),
            "low" | "lowest" | "minor" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A defect report driving one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    /// Key in the external tracker (e.g. `PROJ-123`).
    pub tracker_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
    pub priority: ReportedPriority,
    pub created_at: DateTime<Utc>,
    /// Last change in the tracker, such as a reopen. Intake re-offers a
    /// known ticket when this moves forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Create a ticket with a fresh engine id, stamped now.
    pub fn new(
        tracker_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: ReportedPriority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracker_id: tracker_id.into(),
            title: title.into(),
            description: description.into(),
            error_trace: None,
            priority,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TicketId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_error_trace(mut self, trace: impl Into<String>) -> Self {
        self.error_trace = Some(trace.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Latest of creation and last tracker change.
    pub fn revised_at(&self) -> DateTime<Utc> {
        self.updated_at
            .map_or(self.created_at, |at| at.max(self.created_at))
    }

    /// Whether a non-blank error trace was attached.
    pub fn has_error_trace(&self) -> bool {
        self.error_trace
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

/// A candidate patch produced by the development stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchAttempt {
    pub target_file: String,
    pub patch_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_content: Option<String>,
    /// Opaque quality estimate in [0, 1], supplied by the handler.
    pub confidence: f64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

impl PatchAttempt {
    pub fn new(
        target_file: impl Into<String>,
        patch_content: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            target_file: target_file.into(),
            patch_content: patch_content.into(),
            test_content: None,
            confidence: confidence.clamp(0.0, 1.0),
            success: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_test_content(mut self, tests: impl Into<String>) -> Self {
        self.test_content = Some(tests.into());
        self
    }

    /// Mark the attempt as unsuccessful (patch did not apply cleanly).
    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Ticket status as understood by the external tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Todo,
    InProgress,
    Testing,
    InReview,
    Completed,
    Failed,
    Escalated,
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Testing => write!(f, "testing"),
            Self::InReview => write!(f, "in_review"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_aliases() {
        assert_eq!(
            "Highest".parse::<ReportedPriority>().unwrap(),
            ReportedPriority::Critical
        );
        assert_eq!(
            " medium ".parse::<ReportedPriority>().unwrap(),
            ReportedPriority::Medium
        );
        assert!("whenever".parse::<ReportedPriority>().is_err());
    }

    #[test]
    fn test_blank_error_trace_is_not_a_trace() {
        let ticket = Ticket::new("PROJ-1", "t", "d", ReportedPriority::Low).with_error_trace("  \n");
        assert!(!ticket.has_error_trace());
        let ticket = ticket.with_error_trace("panicked at src/main.rs:3");
        assert!(ticket.has_error_trace());
    }

    #[test]
    fn test_patch_confidence_clamped() {
        assert_eq!(PatchAttempt::new("a.rs", "diff", 1.7).confidence, 1.0);
        assert_eq!(PatchAttempt::new("a.rs", "diff", -0.2).confidence, 0.0);
    }

    #[test]
    fn test_ticket_deserializes_without_optional_fields() {
        let json = r#"{
            "id": "t-1",
            "tracker_id": "PROJ-9",
            "title": "Crash on login",
            "priority": "high",
            "created_at": "2024-05-01T10:00:00Z"
        }"#;
        let ticket: Ticket = serde_json::from_str(json).unwrap();
        assert_eq!(ticket.priority, ReportedPriority::High);
        assert!(ticket.description.is_empty());
        assert!(ticket.error_trace.is_none());
    }
}
