use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use orchestration::EngineConfig;
use serde::Deserialize;

/// Ticket tracker endpoint.
#[derive(Debug, Clone)]
pub struct TrackerEndpoint {
    pub url: String,
    pub token: Option<String>,
}

/// `[app]` table of the config file. Engine sections live alongside it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AppSection {
    tracker_url: Option<String>,
    tracker_token: Option<String>,
    handler_url: Option<String>,
    intake_interval_secs: Option<u64>,
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppFile {
    #[serde(default)]
    app: AppSection,
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    /// Ticket tracker (None = file source or demo only)
    pub tracker: Option<TrackerEndpoint>,
    /// Agent service executing planner/developer/qa/communicator stages
    pub handler_url: Option<String>,
    /// How often the intake loop polls the tracker
    pub intake_interval: Duration,
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tracker: None,
            handler_url: None,
            intake_interval: Duration::from_secs(60),
            log_filter: "info".into(),
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Load with an explicit variable lookup.
    pub fn load_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let (mut engine, app) = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let engine = EngineConfig::from_toml_str(&content)
                    .with_context(|| format!("Invalid engine config in {}", path.display()))?;
                let file: AppFile = toml::from_str(&content)
                    .with_context(|| format!("Invalid [app] table in {}", path.display()))?;
                (engine, file.app)
            }
            None => (EngineConfig::default(), AppSection::default()),
        };

        engine
            .apply_overrides_from(&lookup)
            .context("Invalid REMEDIATION_* override")?;
        engine.validate().context("Engine config rejected")?;

        let tracker_url = lookup("REMEDIATION_TRACKER_URL").or(app.tracker_url);
        let tracker_token = lookup("REMEDIATION_TRACKER_TOKEN").or(app.tracker_token);
        let tracker = tracker_url.map(|url| TrackerEndpoint {
            url: url.trim_end_matches('/').to_string(),
            token: tracker_token,
        });

        let intake_interval_secs = match lookup("REMEDIATION_INTAKE_INTERVAL_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("REMEDIATION_INTAKE_INTERVAL_SECS={raw} is not a number"))?,
            None => app.intake_interval_secs.unwrap_or(60),
        };
        if intake_interval_secs == 0 {
            anyhow::bail!("intake interval must be at least 1 second");
        }

        Ok(Self {
            engine,
            tracker,
            handler_url: lookup("REMEDIATION_HANDLER_URL")
                .or(app.handler_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            intake_interval: Duration::from_secs(intake_interval_secs),
            log_filter: lookup("REMEDIATION_LOG")
                .or(app.log_filter)
                .unwrap_or_else(|| "info".into()),
        })
    }
}

/// Check if an HTTP endpoint answers at all (any status below 500).
pub async fn check_endpoint(url: &str) -> bool {
    match reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => !resp.status().is_server_error(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::ReprocessPolicy;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load_with(None, no_env).unwrap();
        assert!(config.tracker.is_none());
        assert_eq!(config.intake_interval, Duration::from_secs(60));
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.engine.events.capacity, 256);
    }

    #[test]
    fn test_file_with_app_and_engine_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
reprocess = "unblock"

[app]
tracker_url = "https://tracker.example.com/api/"
intake_interval_secs = 15

[retry]
max_retries = 5
"#
        )
        .unwrap();

        let config = AppConfig::load_with(Some(file.path()), no_env).unwrap();
        let tracker = config.tracker.unwrap();
        assert_eq!(tracker.url, "https://tracker.example.com/api");
        assert!(tracker.token.is_none());
        assert_eq!(config.intake_interval, Duration::from_secs(15));
        assert_eq!(config.engine.retry.max_retries, 5);
        assert_eq!(config.engine.reprocess, ReprocessPolicy::Unblock);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[app]\ntracker_url = \"http://file\"\nlog_filter = \"warn\"").unwrap();

        let env: HashMap<&str, &str> = [
            ("REMEDIATION_TRACKER_URL", "http://env"),
            ("REMEDIATION_TRACKER_TOKEN", "secret"),
            ("REMEDIATION_MAX_RETRIES", "1"),
        ]
        .into_iter()
        .collect();
        let lookup = |name: &str| env.get(name).map(|v| v.to_string());

        let config = AppConfig::load_with(Some(file.path()), lookup).unwrap();
        let tracker = config.tracker.unwrap();
        assert_eq!(tracker.url, "http://env");
        assert_eq!(tracker.token.as_deref(), Some("secret"));
        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.engine.retry.max_retries, 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = |name: &str| (name == "REMEDIATION_INTAKE_INTERVAL_SECS").then(|| "0".to_string());
        assert!(AppConfig::load_with(None, zero).is_err());

        let bad_cap =
            |name: &str| (name == "REMEDIATION_GLOBAL_CONCURRENCY").then(|| "0".to_string());
        assert!(AppConfig::load_with(None, bad_cap).is_err());

        let missing = Path::new("/definitely/not/here.toml");
        assert!(AppConfig::load_with(Some(missing), no_env).is_err());
    }
}
