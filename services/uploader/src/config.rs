//! Uploader configuration.
//!
//! Loaded from `config/uploader` files and `UPLOADER__*` environment
//! variables, e.g. `UPLOADER__ENDPOINT=https://api.example.com/api/presigned-url`.

use crate::orchestrator::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the RFQ uploader
#[derive(Debug, Clone, Deserialize)]
pub struct UploaderConfig {
    /// Full URL of the presigned URL endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Retries after the first failed transfer of a file
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Timeout for a single HTTP request in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_endpoint() -> String {
    "http://localhost:8080/api/presigned-url".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl UploaderConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/uploader").required(false))
            .add_source(
                config::Environment::with_prefix("UPLOADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Retry policy for file transfers
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    /// Per-request HTTP timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}
