//! Patch quality gate and publish decision.
//!
//! The development stage only succeeds with a patch at or above
//! `min_confidence`. Once a context has patches, the communication stage
//! reads the [`PublishDecision`] derived from their overall quality.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ticket::PatchAttempt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Minimum confidence for a patch to pass the development gate.
    pub min_confidence: f64,
    /// High-confidence patches needed for a direct pull request.
    pub min_patches: usize,
    /// Average confidence needed for a reviewed pull request.
    pub review_confidence: f64,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            min_patches: 1,
            review_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PatchQuality {
    High,
    Medium,
    Low,
}

/// What the communication stage should do with the patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PublishDecision {
    CreatePr,
    CreatePrWithReview,
    ManualReview,
}

impl std::fmt::Display for PublishDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreatePr => write!(f, "create_pr"),
            Self::CreatePrWithReview => write!(f, "create_pr_with_review"),
            Self::ManualReview => write!(f, "manual_review"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchGate {
    config: PatchConfig,
}

impl PatchGate {
    pub fn new(config: PatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Whether a single patch passes the development gate.
    pub fn accepts(&self, patch: &PatchAttempt) -> bool {
        self.rejection(patch).is_none()
    }

    /// Why a patch fails the development gate, if it does.
    pub fn rejection(&self, patch: &PatchAttempt) -> Option<String> {
        if !patch.success {
            Some(format!("patch for {} did not apply", patch.target_file))
        } else if patch.confidence < self.config.min_confidence {
            Some(format!(
                "patch confidence {:.2} below threshold {:.2}",
                patch.confidence, self.config.min_confidence
            ))
        } else {
            None
        }
    }

    /// Quality over the successful patches of a context.
    pub fn assess(&self, patches: &[PatchAttempt]) -> PatchQuality {
        let successful: Vec<f64> = patches
            .iter()
            .filter(|p| p.success)
            .map(|p| p.confidence)
            .collect();
        if successful.is_empty() {
            return PatchQuality::Low;
        }

        let confident = successful
            .iter()
            .filter(|&&c| c >= self.config.min_confidence)
            .count();
        if confident >= self.config.min_patches {
            return PatchQuality::High;
        }

        let average = successful.iter().sum::<f64>() / successful.len() as f64;
        if average >= self.config.review_confidence {
            PatchQuality::Medium
        } else {
            PatchQuality::Low
        }
    }

    pub fn decide(&self, patches: &[PatchAttempt]) -> PublishDecision {
        match self.assess(patches) {
            PatchQuality::High => PublishDecision::CreatePr,
            PatchQuality::Medium => PublishDecision::CreatePrWithReview,
            PatchQuality::Low => PublishDecision::ManualReview,
        }
    }
}
