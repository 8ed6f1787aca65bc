//! Priority scoring: converts ticket attributes into an ordering score.
//!
//! ```text
//! score = clamp(weight[priority]
//!               + error_trace_boost     (non-blank error trace)
//!               + urgent_keyword_boost  (keyword in title or description),
//!               0.0, 1.0)
//! ```
//!
//! The scorer is a pure function of the ticket and its configuration.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigResult};
use crate::ticket::{ReportedPriority, Ticket};

/// Weight used when neither the ticket's priority nor `medium` is mapped.
const FALLBACK_WEIGHT: f64 = 0.5;

/// Scoring weights and boosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Base weight per reported priority (`critical`, `high`, `medium`, `low`).
    pub weights: HashMap<String, f64>,
    pub error_trace_boost: f64,
    pub urgent_keyword_boost: f64,
    /// Case-insensitive substrings that mark a ticket as urgent.
    pub urgent_keywords: Vec<String>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        let weights = [("critical", 1.0), ("high", 0.8), ("medium", 0.5), ("low", 0.2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            weights,
            error_trace_boost: 0.2,
            urgent_keyword_boost: 0.3,
            urgent_keywords: ["crash", "critical", "urgent", "blocking", "outage", "down"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Per-component view of a score, for logs and the `score` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub error_trace_boost: f64,
    pub keyword_boost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_keyword: Option<String>,
    pub score: f64,
}

/// Computes the dispatch ordering score for a ticket.
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    config: PriorityConfig,
    keywords: Option<Regex>,
}

impl PriorityScorer {
    /// Build a scorer, compiling the urgent keywords into one matcher.
    pub fn new(config: PriorityConfig) -> ConfigResult<Self> {
        let alternatives: Vec<String> = config
            .urgent_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        let keywords = if alternatives.is_empty() {
            None
        } else {
            let pattern = alternatives.join("|");
            Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::InvalidKeywords(e.to_string()))?,
            )
        };

        Ok(Self { config, keywords })
    }

    /// Base weight for a reported priority. Unmapped priorities use the
    /// `medium` weight.
    pub fn weight(&self, priority: ReportedPriority) -> f64 {
        self.config
            .weights
            .get(priority.as_str())
            .or_else(|| self.config.weights.get(ReportedPriority::Medium.as_str()))
            .copied()
            .unwrap_or(FALLBACK_WEIGHT)
    }

    /// First urgent keyword found in the title or description.
    pub fn urgent_match(&self, ticket: &Ticket) -> Option<String> {
        let re = self.keywords.as_ref()?;
        re.find(&ticket.title)
            .or_else(|| re.find(&ticket.description))
            .map(|m| m.as_str().to_ascii_lowercase())
    }

    /// Score in [0.0, 1.0].
    pub fn score(&self, ticket: &Ticket) -> f64 {
        self.explain(ticket).score
    }

    /// Score with each contributing component.
    pub fn explain(&self, ticket: &Ticket) -> ScoreBreakdown {
        let base = self.weight(ticket.priority);
        let error_trace_boost = if ticket.has_error_trace() {
            self.config.error_trace_boost
        } else {
            0.0
        };
        let matched_keyword = self.urgent_match(ticket);
        let keyword_boost = if matched_keyword.is_some() {
            self.config.urgent_keyword_boost
        } else {
            0.0
        };
        let score = (base + error_trace_boost + keyword_boost).clamp(0.0, 1.0);

        ScoreBreakdown {
            base,
            error_trace_boost,
            keyword_boost,
            matched_keyword,
            score,
        }
    }
}
