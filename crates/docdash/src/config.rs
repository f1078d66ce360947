//! Upload orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::track::TrackerOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Endpoint receiving the multipart batch POST.
    pub submit_url: String,
    /// Base endpoint for per-job status polling (`GET {status_url}/{job_id}`).
    pub status_url: String,
    /// Optional base endpoint for push-based batch status streams
    /// (`GET {stream_url}/{batch_id}`).
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum polling ticks before giving up on remaining jobs.
    /// `None` polls until every job is terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_attempts() -> Option<u32> {
    Some(150)
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl UploadConfig {
    pub fn new(submit_url: &str, status_url: &str) -> Self {
        Self {
            submit_url: submit_url.to_string(),
            status_url: status_url.to_string(),
            stream_url: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.submit_url.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "submit_url must not be empty".to_string(),
            });
        }
        if self.status_url.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "status_url must not be empty".to_string(),
            });
        }
        if self.poll_interval_ms < 100 {
            return Err(ConfigError::Validation {
                message: format!(
                    "poll_interval_ms must be at least 100, got {}",
                    self.poll_interval_ms
                ),
            });
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Validation {
                message: "max_attempts must be greater than 0 when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config: UploadConfig = serde_json::from_str(
            r#"{"submit_url": "https://api.test/batches", "status_url": "https://api.test/jobs"}"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.max_attempts, Some(150));
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.stream_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_empty_urls() {
        let config = UploadConfig::new("", "https://api.test/jobs");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_subsecond_interval() {
        let mut config = UploadConfig::new("https://api.test/batches", "https://api.test/jobs");
        config.poll_interval_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_attempt_cap() {
        let mut config = UploadConfig::new("https://api.test/batches", "https://api.test/jobs");
        config.max_attempts = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tracker_options_mapping() {
        let mut config = UploadConfig::new("https://api.test/batches", "https://api.test/jobs");
        config.poll_interval_ms = 500;
        config.max_attempts = None;

        let options = config.tracker_options();
        assert_eq!(options.interval, Duration::from_millis(500));
        assert_eq!(options.max_attempts, None);
    }
}
