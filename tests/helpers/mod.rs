//! Scripted collaborators for driving the ingestion worker in tests

use async_trait::async_trait;
use image_labeler::models::label::LabelResult;
use image_labeler::services::classifier::{
    ClassificationClient, ClassificationSettings, DetectLabelsRequest, DetectLabelsResponse,
    DetectedLabel, DetectorError, LabelDetector,
};
use image_labeler::services::label_store::{LabelStore, MemoryLabelStore, StoreError};
use image_labeler::services::storage::MemoryObjectStore;
use image_labeler::services::thumbnail::{ThumbnailGenerator, ThumbnailSettings};
use image_labeler::worker::{IngestionWorker, WorkerSettings};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::fixtures::THUMBNAIL_BUCKET;

/// Detector answering per object key; unknown keys get an empty label list.
#[derive(Default)]
pub struct ScriptedDetector {
    responses: Mutex<HashMap<String, Result<Vec<DetectedLabel>, DetectorError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDetector {
    pub fn respond(&self, key: &str, labels: &[(&str, f64)]) {
        let labels = labels
            .iter()
            .map(|(name, confidence)| DetectedLabel::new(*name, *confidence))
            .collect();
        self.responses
            .lock()
            .unwrap()
            .insert(key.to_string(), Ok(labels));
    }

    pub fn fail(&self, key: &str, err: DetectorError) {
        self.responses
            .lock()
            .unwrap()
            .insert(key.to_string(), Err(err));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LabelDetector for ScriptedDetector {
    async fn detect_labels(
        &self,
        request: &DetectLabelsRequest,
    ) -> Result<DetectLabelsResponse, DetectorError> {
        self.calls.lock().unwrap().push(request.image.key.clone());
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get(&request.image.key)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));
        scripted.map(|labels| DetectLabelsResponse { labels })
    }
}

/// Label store whose saves fail for selected keys.
#[derive(Default)]
pub struct FlakyLabelStore {
    inner: MemoryLabelStore,
    unavailable: Mutex<Vec<String>>,
}

impl FlakyLabelStore {
    pub fn unavailable_for(&self, key: &str) {
        self.unavailable.lock().unwrap().push(key.to_string());
    }
}

#[async_trait]
impl LabelStore for FlakyLabelStore {
    async fn save(&self, result: &LabelResult) -> Result<(), StoreError> {
        if self.unavailable.lock().unwrap().contains(&result.image_key) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.save(result).await
    }

    async fn get(&self, image_key: &str) -> Result<Option<LabelResult>, StoreError> {
        self.inner.get(image_key).await
    }

    async fn delete(&self, image_key: &str) -> Result<bool, StoreError> {
        self.inner.delete(image_key).await
    }
}

/// A fully wired worker over in-memory collaborators.
pub struct Harness {
    pub detector: Arc<ScriptedDetector>,
    pub storage: Arc<MemoryObjectStore>,
    pub labels: Arc<FlakyLabelStore>,
    pub worker: IngestionWorker,
}

impl Harness {
    pub fn new(settings: WorkerSettings) -> Self {
        let detector = Arc::new(ScriptedDetector::default());
        let storage = Arc::new(MemoryObjectStore::new());
        let labels = Arc::new(FlakyLabelStore::default());

        let thumbnails = ThumbnailGenerator::new(
            storage.clone(),
            ThumbnailSettings {
                bucket: THUMBNAIL_BUCKET.to_string(),
                prefix: "thumbnails/".to_string(),
                max_dimension: 32,
            },
        )
        .expect("thumbnail settings");

        let worker = IngestionWorker::new(
            ClassificationClient::new(detector.clone(), ClassificationSettings::default()),
            Some(Arc::new(thumbnails)),
            labels.clone(),
            settings,
        );

        Self {
            detector,
            storage,
            labels,
            worker,
        }
    }
}
