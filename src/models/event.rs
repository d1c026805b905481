use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single image write, normalized out of a storage notification.
///
/// `key` is always the un-escaped object key, ready to hand to storage or
/// classification APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEvent {
    bucket: String,
    key: String,
    received_at: DateTime<Utc>,
}

impl ImageEvent {
    pub fn new(bucket: String, key: String, received_at: DateTime<Utc>) -> Self {
        Self {
            bucket,
            key,
            received_at,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
