use serde::{Deserialize, Serialize};

/// One detected label with its confidence in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: f64,
}

/// The filtered label set for one image, highest confidence first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    pub image_key: String,
    pub labels: Vec<Label>,
}

impl LabelResult {
    pub fn new(image_key: impl Into<String>, labels: Vec<Label>) -> Self {
        Self {
            image_key: image_key.into(),
            labels,
        }
    }

    pub fn label_names(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.name.as_str()).collect()
    }
}

/// Where a generated thumbnail was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailRef {
    pub bucket: String,
    pub key: String,
    pub width: u32,
    pub height: u32,
}
