use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the `batch` binary.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// AES-256-GCM encryption key (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// HS256 secret for caller bearer tokens
    pub jwt_secret: String,

    #[serde(default = "default_concurrency")]
    pub batch_concurrency: usize,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,

    /// Idle batches are dropped from memory after this long.
    #[serde(default = "default_batch_retention_secs")]
    pub batch_retention_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_concurrency() -> usize {
    3
}

fn default_confidence_threshold() -> f64 {
    0.85
}

fn default_max_batch_size() -> usize {
    10
}

fn default_extraction_timeout_secs() -> u64 {
    30
}

fn default_batch_retention_secs() -> u64 {
    3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn batch_config(&self) -> Result<BatchConfig, garde::Report> {
        let config = BatchConfig {
            concurrency: self.batch_concurrency,
            confidence_threshold: self.confidence_threshold,
            max_batch_size: self.max_batch_size,
            extraction_timeout_secs: self.extraction_timeout_secs,
            retention_secs: self.batch_retention_secs,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Tuning for batch runs.
#[derive(Debug, Clone, Validate)]
pub struct BatchConfig {
    #[garde(range(min = 1, max = 10))]
    pub concurrency: usize,

    /// Items below this confidence are flagged for review.
    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f64,

    #[garde(range(min = 1, max = 10))]
    pub max_batch_size: usize,

    #[garde(range(min = 1, max = 300))]
    pub extraction_timeout_secs: u64,

    #[garde(range(min = 60))]
    pub retention_secs: u64,
}

impl BatchConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            confidence_threshold: default_confidence_threshold(),
            max_batch_size: default_max_batch_size(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
            retention_secs: default_batch_retention_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_batch_config_is_valid() {
        let config = BatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.extraction_timeout(), Duration::from_secs(30));
        assert_eq!(config.retention(), Duration::from_secs(3600));
    }

    #[test]
    fn test_out_of_range_concurrency_is_rejected() {
        let config = BatchConfig {
            concurrency: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
