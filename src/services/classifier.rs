use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::models::label::{Label, LabelResult};

/// Image to run detection on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRef {
    pub bucket: String,
    pub key: String,
}

/// Fixed request shape sent to the label detection service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectLabelsRequest {
    pub image: ImageRef,
    pub max_labels: usize,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectLabelsResponse {
    #[serde(default)]
    pub labels: Vec<DetectedLabel>,
}

/// A raw detection as returned by the service, before filtering.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectedLabel {
    pub name: String,
    pub confidence: f64,
    #[serde(default)]
    pub instances: Vec<serde_json::Value>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DetectedLabel {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
            instances: Vec::new(),
            parents: Vec::new(),
        }
    }
}

/// The external label detection capability.
#[async_trait]
pub trait LabelDetector: Send + Sync {
    async fn detect_labels(
        &self,
        request: &DetectLabelsRequest,
    ) -> Result<DetectLabelsResponse, DetectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationSettings {
    pub max_labels: usize,
    pub min_confidence: f64,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            max_labels: 10,
            min_confidence: 50.0,
        }
    }
}

/// Wraps a [`LabelDetector`] with confidence filtering and a result cap.
#[derive(Clone)]
pub struct ClassificationClient {
    detector: Arc<dyn LabelDetector>,
    settings: ClassificationSettings,
}

impl ClassificationClient {
    pub fn new(detector: Arc<dyn LabelDetector>, settings: ClassificationSettings) -> Self {
        Self { detector, settings }
    }

    pub fn settings(&self) -> ClassificationSettings {
        self.settings
    }

    pub async fn classify(&self, bucket: &str, key: &str) -> Result<LabelResult, ClassificationError> {
        let request = DetectLabelsRequest {
            image: ImageRef {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            max_labels: self.settings.max_labels,
            min_confidence: self.settings.min_confidence,
        };

        let response = self.detector.detect_labels(&request).await?;

        for label in &response.labels {
            debug!(
                key,
                name = %label.name,
                confidence = label.confidence,
                instances = label.instances.len(),
                parents = ?label.parents,
                "Raw detection"
            );
        }

        Ok(LabelResult::new(key, self.filter(response.labels)))
    }

    /// Keep labels at or above the minimum confidence, highest first, capped.
    /// The service is asked to filter too, but its answer is not trusted.
    fn filter(&self, detected: Vec<DetectedLabel>) -> Vec<Label> {
        let mut labels: Vec<Label> = detected
            .into_iter()
            .filter(|l| {
                !l.name.trim().is_empty()
                    && l.confidence.is_finite()
                    && l.confidence <= 100.0
                    && l.confidence >= self.settings.min_confidence
            })
            .map(|l| Label {
                name: l.name,
                confidence: l.confidence,
            })
            .collect();

        labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        labels.truncate(self.settings.max_labels);
        labels
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DetectorError {
    #[error("Detection service throttled the request")]
    Throttled,

    #[error("Detection request timed out")]
    Timeout,

    #[error("Detection transport error: {0}")]
    Transport(String),

    #[error("Detection service returned an unusable response: {0}")]
    Decode(String),

    #[error("Detection service rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Credentials or model endpoint refused. Not a property of the image.
    #[error("Detection service refused access (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Image cannot be read or decoded: {0}")]
    InvalidImage(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassificationError {
    #[error("Classification unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),
}

impl ClassificationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassificationError::Unavailable(_))
    }
}

impl From<DetectorError> for ClassificationError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Throttled
            | DetectorError::Timeout
            | DetectorError::Transport(_)
            | DetectorError::Decode(_)
            | DetectorError::Unauthorized { .. } => ClassificationError::Unavailable(err.to_string()),
            DetectorError::Rejected { .. } | DetectorError::InvalidImage(_) => {
                ClassificationError::InvalidImage(err.to_string())
            }
        }
    }
}
