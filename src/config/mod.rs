use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::services::classifier::ClassificationSettings;
use crate::services::queue::QueueSettings;
use crate::services::thumbnail::ThumbnailSettings;
use crate::worker::WorkerSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Ops server bind address for /health and /metrics.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the image queue
    pub redis_url: String,

    /// Key prefix for queue structures in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// S3-compatible storage endpoint URL
    pub storage_endpoint: String,

    #[serde(default = "default_storage_region")]
    pub storage_region: String,

    pub storage_access_key: String,

    pub storage_secret_key: String,

    /// Bucket thumbnails are written to
    pub thumbnail_bucket: String,

    #[serde(default = "default_thumbnail_prefix")]
    pub thumbnail_prefix: String,

    #[serde(default = "default_thumbnail_max_dimension")]
    pub thumbnail_max_dimension: u32,

    #[serde(default = "default_max_labels")]
    pub max_labels: usize,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Messages received per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records processed in parallel within a batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// Long-poll wait per receive call
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    /// Timeout applied to each external call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Decode every inner notification record instead of only the first
    #[serde(default)]
    pub fan_out_records: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_queue_prefix() -> String {
    "image_labeler".to_string()
}

fn default_storage_region() -> String {
    "auto".to_string()
}

fn default_thumbnail_prefix() -> String {
    "thumbnails/".to_string()
}

fn default_thumbnail_max_dimension() -> u32 {
    256
}

fn default_max_labels() -> usize {
    10
}

fn default_min_confidence() -> f64 {
    50.0
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    4
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    2
}

fn default_wait_time_secs() -> u64 {
    20
}

fn default_call_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    /// Validated pipeline tuning derived from this configuration.
    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let pipeline = PipelineConfig {
            max_labels: self.max_labels,
            min_confidence: self.min_confidence,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            visibility_timeout_secs: self.visibility_timeout_secs,
            max_receive_count: self.max_receive_count,
            wait_time_secs: self.wait_time_secs,
            call_timeout_secs: self.call_timeout_secs,
            thumbnail_max_dimension: self.thumbnail_max_dimension,
            fan_out_records: self.fan_out_records,
        };
        pipeline
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(pipeline)
    }

    pub fn thumbnail_settings(&self) -> ThumbnailSettings {
        ThumbnailSettings {
            bucket: self.thumbnail_bucket.clone(),
            prefix: self.thumbnail_prefix.clone(),
            max_dimension: self.thumbnail_max_dimension,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            prefix: self.queue_prefix.clone(),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            max_receive_count: self.max_receive_count,
        }
    }
}

/// Numeric knobs of the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct PipelineConfig {
    #[garde(range(min = 1, max = 1000))]
    pub max_labels: usize,

    #[garde(range(min = 0.0, max = 100.0))]
    pub min_confidence: f64,

    #[garde(range(min = 1, max = 100))]
    pub batch_size: usize,

    #[garde(range(min = 1, max = 256))]
    pub concurrency: usize,

    #[garde(range(min = 1))]
    pub visibility_timeout_secs: u64,

    #[garde(range(min = 1))]
    pub max_receive_count: u32,

    #[garde(skip)]
    pub wait_time_secs: u64,

    #[garde(range(min = 1))]
    pub call_timeout_secs: u64,

    #[garde(range(min = 1))]
    pub thumbnail_max_dimension: u32,

    #[garde(skip)]
    pub fan_out_records: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_labels: default_max_labels(),
            min_confidence: default_min_confidence(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            wait_time_secs: default_wait_time_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            thumbnail_max_dimension: default_thumbnail_max_dimension(),
            fan_out_records: false,
        }
    }
}

impl PipelineConfig {
    pub fn classification(&self) -> ClassificationSettings {
        ClassificationSettings {
            max_labels: self.max_labels,
            min_confidence: self.min_confidence,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Time budget for one batch: the visibility timeout minus a safety
    /// margin of 2s or 10%, whichever is larger.
    pub fn batch_deadline(&self) -> Duration {
        let visibility = self.visibility_timeout();
        let margin = (visibility / 10).max(Duration::from_secs(2));
        visibility.saturating_sub(margin).max(Duration::from_millis(500))
    }

    pub fn worker(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.concurrency,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            batch_deadline: Some(self.batch_deadline()),
            fan_out: self.fan_out_records,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
