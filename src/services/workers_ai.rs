use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::services::classifier::{
    DetectLabelsRequest, DetectLabelsResponse, DetectedLabel, DetectorError, LabelDetector,
};
use crate::services::storage::{ObjectStore, StorageError};

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
const CLASSIFICATION_MODEL: &str = "@cf/microsoft/resnet-50";

/// Label detector backed by a Cloudflare Workers AI image classification model.
///
/// The model only accepts image bytes, so the referenced object is read from
/// storage first. Scores come back in `[0, 1]` and are scaled to `[0, 100]`.
pub struct WorkersAiDetector {
    http: Client,
    storage: Arc<dyn ObjectStore>,
    base_url: String,
    account_id: String,
    api_token: String,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    image: &'a [u8],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    result: Vec<ClassifyScore>,
}

#[derive(Deserialize)]
struct ClassifyScore {
    label: String,
    score: f64,
}

impl WorkersAiDetector {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        account_id: &str,
        api_token: &str,
        timeout: Duration,
    ) -> Result<Self, DetectorError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectorError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            storage,
            base_url: DEFAULT_BASE_URL.to_string(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }

    /// Point the client at a different API host (e.g. a gateway or a stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn model_url(&self) -> String {
        format!(
            "{}/accounts/{}/ai/run/{}",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            CLASSIFICATION_MODEL
        )
    }
}

#[async_trait]
impl LabelDetector for WorkersAiDetector {
    async fn detect_labels(
        &self,
        request: &DetectLabelsRequest,
    ) -> Result<DetectLabelsResponse, DetectorError> {
        let image_bytes = self
            .storage
            .read_object(&request.image.bucket, &request.image.key)
            .await
            .map_err(|e| match e {
                StorageError::Unavailable(msg) => DetectorError::Transport(msg),
                other => DetectorError::InvalidImage(other.to_string()),
            })?;

        image::guess_format(&image_bytes)
            .map_err(|e| DetectorError::InvalidImage(e.to_string()))?;

        let response = self
            .http
            .post(self.model_url())
            .bearer_auth(&self.api_token)
            .json(&ClassifyRequest {
                image: &image_bytes,
            })
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(map_status(status, message));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Decode(e.to_string()))?;

        Ok(scores_to_response(body.result, request))
    }
}

fn map_transport_error(err: reqwest::Error) -> DetectorError {
    if err.is_timeout() {
        DetectorError::Timeout
    } else {
        DetectorError::Transport(err.to_string())
    }
}

fn map_status(status: StatusCode, message: String) -> DetectorError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        DetectorError::Throttled
    } else if matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    ) {
        DetectorError::Unauthorized {
            status: status.as_u16(),
            message,
        }
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        DetectorError::Transport(format!("HTTP {}: {}", status.as_u16(), message))
    } else {
        DetectorError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

/// Apply the request's threshold and cap on the service side of the seam.
fn scores_to_response(scores: Vec<ClassifyScore>, request: &DetectLabelsRequest) -> DetectLabelsResponse {
    let mut labels: Vec<DetectedLabel> = scores
        .into_iter()
        .map(|s| DetectedLabel::new(s.label, s.score * 100.0))
        .filter(|l| l.confidence >= request.min_confidence)
        .collect();
    labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    labels.truncate(request.max_labels);
    DetectLabelsResponse { labels }
}
