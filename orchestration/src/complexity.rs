//! Complexity estimation from ticket text.
//!
//! ```text
//! Ticket → ComplexityEstimator → ComplexityClass
//!   │                                 │
//!   │  no error trace                 │→ High   (harder to diagnose)
//!   │  description < threshold chars  │→ Low
//!   │  mentions multiple files        │→ High
//!   │  otherwise                      │→ configured default (Medium)
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ticket::Ticket;

/// Complexity assessment for a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for ComplexityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown complexity class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    /// Descriptions shorter than this many characters are `Low`.
    pub description_threshold: usize,
    pub default_class: ComplexityClass,
    /// Phrases indicating a change spanning several files.
    pub multi_file_markers: Vec<String>,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            description_threshold: 100,
            default_class: ComplexityClass::Medium,
            multi_file_markers: vec!["multiple files".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComplexityEstimator {
    config: ComplexityConfig,
}

impl ComplexityEstimator {
    pub fn new(config: ComplexityConfig) -> Self {
        Self { config }
    }

    pub fn estimate(&self, ticket: &Ticket) -> ComplexityClass {
        if !ticket.has_error_trace() {
            return ComplexityClass::High;
        }

        if ticket.description.chars().count() < self.config.description_threshold {
            return ComplexityClass::Low;
        }

        let lower = ticket.description.to_lowercase();
        if self
            .config
            .multi_file_markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
        {
            return ComplexityClass::High;
        }

        self.config.default_class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::ReportedPriority;

    fn ticket(description: &str, trace: Option<&str>) -> Ticket {
        let t = Ticket::new("PROJ-7", "title", description, ReportedPriority::Medium);
        match trace {
            Some(tr) => t.with_error_trace(tr),
            None => t,
        }
    }

    #[test]
    fn test_missing_trace_is_high() {
        let e = ComplexityEstimator::default();
        assert_eq!(e.estimate(&ticket("short", None)), ComplexityClass::High);
    }

    #[test]
    fn test_short_description_is_low() {
        let e = ComplexityEstimator::default();
        assert_eq!(
            e.estimate(&ticket("NPE in parser", Some("at Parser.java:10"))),
            ComplexityClass::Low
        );
    }

    #[test]
    fn test_multiple_files_is_high() {
        let e = ComplexityEstimator::default();
        let desc = format!("{} The fix touches Multiple Files in the billing module.", "x".repeat(100));
        assert_eq!(e.estimate(&ticket(&desc, Some("trace"))), ComplexityClass::High);
    }

    #[test]
    fn test_long_description_uses_default() {
        let e = ComplexityEstimator::new(ComplexityConfig {
            default_class: ComplexityClass::Low,
            ..Default::default()
        });
        let desc = "y".repeat(150);
        assert_eq!(e.estimate(&ticket(&desc, Some("trace"))), ComplexityClass::Low);

        let e = ComplexityEstimator::default();
        assert_eq!(e.estimate(&ticket(&desc, Some("trace"))), ComplexityClass::Medium);
    }

    #[test]
    fn test_threshold_counts_chars_not_bytes() {
        let e = ComplexityEstimator::new(ComplexityConfig {
            description_threshold: 5,
            ..Default::default()
        });
        // 4 chars, 8 bytes
        assert_eq!(e.estimate(&ticket("éééé", Some("trace"))), ComplexityClass::Low);
    }
}
