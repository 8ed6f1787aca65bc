//! Engine configuration.
//!
//! Every section has defaults, so an empty TOML file is a valid config.
//! Values are layered: defaults, then the TOML file, then `REMEDIATION_*`
//! environment variables, then [`EngineConfig::validate`].

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::BreakerConfig;
use crate::complexity::ComplexityConfig;
use crate::escalation::EscalationConfig;
use crate::events::DEFAULT_CHANNEL_CAPACITY;
use crate::pipeline::patch::PatchConfig;
use crate::priority::PriorityConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid urgent keywords: {0}")]
    InvalidKeywords(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What to do when an already-known ticket is submitted again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessPolicy {
    /// Ignore the duplicate.
    #[default]
    Skip,
    /// Re-arm a failed or escalated context, keeping its history.
    Unblock,
    /// Replace the context with a fresh one.
    Reset,
}

impl FromStr for ReprocessPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "unblock" => Ok(Self::Unblock),
            "reset" => Ok(Self::Reset),
            other => Err(ConfigError::Invalid(format!(
                "unknown reprocess policy '{other}' (expected skip, unblock or reset)"
            ))),
        }
    }
}

impl std::fmt::Display for ReprocessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Unblock => write!(f, "unblock"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum stage executions in flight across all tickets.
    pub global_concurrency: usize,
    /// Maximum concurrent calls to any single dependency.
    pub dependency_concurrency: usize,
    /// Scheduler wake-up interval when nothing is waiting, in milliseconds.
    pub idle_poll_ms: u64,
    pub cleanup_interval_secs: u64,
    /// Terminal contexts older than this are pruned.
    pub max_context_age_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 8,
            dependency_concurrency: 4,
            idle_poll_ms: 1_000,
            cleanup_interval_secs: 3_600,
            max_context_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Undelivered events kept per subscriber before the oldest are dropped.
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Outcomes kept for the rolling success rate and average duration.
    pub window: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { window: 50 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub priority: PriorityConfig,
    pub complexity: ComplexityConfig,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub dispatch: DispatchConfig,
    pub escalation: EscalationConfig,
    pub patch: PatchConfig,
    pub events: EventConfig,
    pub registry: RegistryConfig,
    pub reprocess: ReprocessPolicy,
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name}={value} is not a valid value")))
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file. Does not apply env overrides or validate.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Overlay `REMEDIATION_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup`, keyed by environment variable name.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        macro_rules! overlay {
            ($name:literal, $field:expr) => {
                if let Some(value) = lookup($name) {
                    $field = parse_var($name, &value)?;
                    tracing::debug!(var = $name, value = %value, "Config override");
                }
            };
        }

        overlay!("REMEDIATION_MAX_RETRIES", self.retry.max_retries);
        overlay!("REMEDIATION_BASE_DELAY_MS", self.retry.base_delay_ms);
        overlay!("REMEDIATION_MAX_DELAY_MS", self.retry.max_delay_ms);
        overlay!("REMEDIATION_MAX_CIRCUIT_WAITS", self.retry.max_circuit_waits);
        overlay!("REMEDIATION_FAILURE_THRESHOLD", self.breaker.failure_threshold);
        overlay!("REMEDIATION_RESET_TIMEOUT_MS", self.breaker.reset_timeout_ms);
        overlay!("REMEDIATION_GLOBAL_CONCURRENCY", self.dispatch.global_concurrency);
        overlay!(
            "REMEDIATION_DEPENDENCY_CONCURRENCY",
            self.dispatch.dependency_concurrency
        );
        overlay!("REMEDIATION_FAILURE_WINDOW", self.escalation.failure_window);
        overlay!("REMEDIATION_MIN_CONFIDENCE", self.patch.min_confidence);
        overlay!("REMEDIATION_EVENT_CAPACITY", self.events.capacity);
        overlay!("REMEDIATION_REPROCESS", self.reprocess);
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        fn unit(name: &str, value: f64) -> ConfigResult<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )))
            }
        }
        fn positive(name: &str, value: usize) -> ConfigResult<()> {
            if value > 0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be at least 1")))
            }
        }

        for (priority, weight) in &self.priority.weights {
            unit(&format!("priority.weights.{priority}"), *weight)?;
        }
        unit("priority.error_trace_boost", self.priority.error_trace_boost)?;
        unit("priority.urgent_keyword_boost", self.priority.urgent_keyword_boost)?;

        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_multiplier must be >= 1, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        positive("dispatch.global_concurrency", self.dispatch.global_concurrency)?;
        positive(
            "dispatch.dependency_concurrency",
            self.dispatch.dependency_concurrency,
        )?;
        positive("escalation.failure_window", self.escalation.failure_window)?;
        positive("events.capacity", self.events.capacity)?;
        positive("registry.window", self.registry.window)?;

        unit("patch.min_confidence", self.patch.min_confidence)?;
        unit("patch.review_confidence", self.patch.review_confidence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.dispatch.global_concurrency, 8);
        assert_eq!(config.events.capacity, 256);
        assert_eq!(config.reprocess, ReprocessPolicy::Skip);
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
reprocess = "unblock"

[retry]
max_retries = 5

[breaker]
reset_timeout_ms = 10000

[priority.weights]
critical = 0.9
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.breaker.reset_timeout_ms, 10_000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.reprocess, ReprocessPolicy::Unblock);
        assert_eq!(config.priority.weights.get("critical"), Some(&0.9));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_file("/nonexistent/remediation.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = EngineConfig::from_toml_str("[retry\nmax_retries = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REMEDIATION_MAX_RETRIES", "1"),
            ("REMEDIATION_GLOBAL_CONCURRENCY", "2"),
            ("REMEDIATION_REPROCESS", "reset"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.dispatch.global_concurrency, 2);
        assert_eq!(config.reprocess, ReprocessPolicy::Reset);
    }

    #[test]
    fn test_bad_env_override_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides_from(|name| {
                (name == "REMEDIATION_MAX_RETRIES").then(|| "many".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("REMEDIATION_MAX_RETRIES"));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = EngineConfig::default();
        config.priority.weights.insert("critical".into(), 1.5);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.dispatch.global_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
