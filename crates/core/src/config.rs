// crates/core/src/config.rs
//! Monitor configuration.
//!
//! Precedence, lowest to highest: built-in defaults, optional TOML file,
//! `JOBWATCH_*` environment variables, then whatever the caller sets on the
//! returned struct (CLI flags).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::PollOptions;

pub const ENV_BASE_URL: &str = "JOBWATCH_BASE_URL";
pub const ENV_STATUS_PATH: &str = "JOBWATCH_STATUS_PATH";
pub const ENV_API_KEY: &str = "JOBWATCH_API_KEY";
pub const ENV_POLL_INTERVAL_SECS: &str = "JOBWATCH_POLL_INTERVAL_SECS";
pub const ENV_MAX_DURATION_SECS: &str = "JOBWATCH_MAX_DURATION_SECS";
pub const ENV_MAX_CONSECUTIVE_ERRORS: &str = "JOBWATCH_MAX_CONSECUTIVE_ERRORS";

/// Placeholder substituted with the percent-encoded job id.
pub const JOB_ID_PLACEHOLDER: &str = "{job_id}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub client: ClientConfig,
    pub polling: PollingConfig,
}

/// Where and how to reach the job status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Path template containing `{job_id}`.
    pub status_path: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            status_path: "/api/jobs/{job_id}".into(),
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: f64,
    pub max_duration_secs: f64,
    pub max_consecutive_errors: u32,
    /// Identical readings in a row before a job counts as stalled.
    pub stall_window: usize,
    /// Interval multiplier applied after each stalled poll.
    pub stall_backoff: Option<f64>,
    pub max_interval_secs: f64,
    /// Single-poll progress increase (percentage points) flagged as suspicious.
    pub jump_threshold: Option<f64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            max_duration_secs: 600.0,
            max_consecutive_errors: 3,
            stall_window: 3,
            stall_backoff: None,
            max_interval_secs: 60.0,
            jump_threshold: None,
        }
    }
}

impl PollingConfig {
    pub fn to_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_secs_f64(self.interval_secs),
            max_duration: Duration::from_secs_f64(self.max_duration_secs),
            max_consecutive_errors: self.max_consecutive_errors,
            stall_window: self.stall_window,
            stall_backoff: self.stall_backoff,
            max_interval: Duration::from_secs_f64(self.max_interval_secs),
            jump_threshold: self.jump_threshold,
        }
    }
}

impl MonitorConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    /// The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `JOBWATCH_*` overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_BASE_URL) {
            self.client.base_url = v;
        }
        if let Some(v) = lookup(ENV_STATUS_PATH) {
            self.client.status_path = v;
        }
        if let Some(v) = lookup(ENV_API_KEY) {
            self.client.api_key = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_SECS) {
            self.polling.interval_secs = parse_env(ENV_POLL_INTERVAL_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_DURATION_SECS) {
            self.polling.max_duration_secs = parse_env(ENV_MAX_DURATION_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_CONSECUTIVE_ERRORS) {
            self.polling.max_consecutive_errors = parse_env(ENV_MAX_CONSECUTIVE_ERRORS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(&self.client.base_url)
            .map_err(|e| ConfigError::invalid("client.base_url", e.to_string()))?;
        if !self.client.status_path.contains(JOB_ID_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "client.status_path",
                format!("must contain {JOB_ID_PLACEHOLDER}"),
            ));
        }
        if self.client.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "client.request_timeout_secs",
                "must be greater than zero",
            ));
        }

        let p = &self.polling;
        positive_secs("polling.interval_secs", p.interval_secs)?;
        positive_secs("polling.max_duration_secs", p.max_duration_secs)?;
        positive_secs("polling.max_interval_secs", p.max_interval_secs)?;
        if p.max_consecutive_errors == 0 {
            return Err(ConfigError::invalid(
                "polling.max_consecutive_errors",
                "must be at least 1",
            ));
        }
        if p.stall_window < 2 {
            return Err(ConfigError::invalid("polling.stall_window", "must be at least 2"));
        }
        if let Some(b) = p.stall_backoff {
            if !(b >= 1.0 && b.is_finite()) {
                return Err(ConfigError::invalid(
                    "polling.stall_backoff",
                    "must be a finite multiplier >= 1.0",
                ));
            }
        }
        if let Some(j) = p.jump_threshold {
            if !(j > 0.0 && j <= 100.0) {
                return Err(ConfigError::invalid(
                    "polling.jump_threshold",
                    "must be within (0, 100]",
                ));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("cannot parse {raw:?}")))
}

fn positive_secs(field: &'static str, secs: f64) -> Result<(), ConfigError> {
    // Duration::from_secs_f64 panics on negative, NaN or overflowing input.
    if secs > 0.0 && secs.is_finite() && secs < u32::MAX as f64 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be a positive number of seconds"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        config.validate().unwrap();
        let opts = config.polling.to_options();
        assert_eq!(opts.interval, Duration::from_secs(5));
        assert_eq!(opts.max_duration, Duration::from_secs(600));
        assert_eq!(opts.max_consecutive_errors, 3);
        assert_eq!(opts.stall_window, 3);
    }

    #[test]
    fn test_from_file_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
base_url = "https://mivaa.example.com"
api_key = "anon-key"

[polling]
interval_secs = 2.5
stall_backoff = 1.5
"#
        )
        .unwrap();

        let config = MonitorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.client.base_url, "https://mivaa.example.com");
        assert_eq!(config.client.api_key.as_deref(), Some("anon-key"));
        assert_eq!(config.client.status_path, "/api/jobs/{job_id}");
        assert_eq!(config.polling.interval_secs, 2.5);
        assert_eq!(config.polling.stall_backoff, Some(1.5));
        assert_eq!(config.polling.max_consecutive_errors, 3);
    }

    #[test]
    fn test_from_file_missing() {
        let err = MonitorConfig::from_file(Path::new("/nonexistent/jobwatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[polling\ninterval_secs = ").unwrap();
        let err = MonitorConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BASE_URL, "https://other.example.com"),
            (ENV_POLL_INTERVAL_SECS, "10"),
            (ENV_MAX_CONSECUTIVE_ERRORS, "5"),
            (ENV_API_KEY, ""),
        ]
        .into_iter()
        .collect();

        let mut config = MonitorConfig::default();
        config.client.api_key = Some("from-file".into());
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.client.base_url, "https://other.example.com");
        assert_eq!(config.polling.interval_secs, 10.0);
        assert_eq!(config.polling.max_consecutive_errors, 5);
        assert_eq!(config.client.api_key, None);
    }

    #[test]
    fn test_env_override_unparseable() {
        let mut config = MonitorConfig::default();
        let err = config
            .apply_env_with(|k| (k == ENV_MAX_DURATION_SECS).then(|| "ten minutes".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_DURATION_SECS));
    }

    #[test]
    #[serial_test::serial]
    fn test_load_reads_process_env() {
        std::env::set_var(ENV_MAX_DURATION_SECS, "120");
        let config = MonitorConfig::load(None);
        std::env::remove_var(ENV_MAX_DURATION_SECS);
        assert_eq!(config.unwrap().polling.max_duration_secs, 120.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MonitorConfig::default();
        config.polling.interval_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.polling.stall_window = 1;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.polling.stall_backoff = Some(0.5);
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.polling.jump_threshold = Some(150.0);
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.client.status_path = "/api/jobs".into();
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.client.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }
}
