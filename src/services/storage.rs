use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read/write access to binary objects, addressed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// Client for S3-compatible object storage (AWS S3, Cloudflare R2, MinIO).
pub struct S3Storage {
    region: Region,
    credentials: Credentials,
}

impl S3Storage {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket(bucket)?
            .get_object(key)
            .await
            .map_err(|e| StorageError::from_s3(e, bucket, key))?;
        check_status(response.status_code(), bucket, key)?;
        Ok(response.bytes().to_vec())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .bucket(bucket)?
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(|e| StorageError::from_s3(e, bucket, key))?;
        check_status(response.status_code(), bucket, key)
    }
}

fn check_status(status: u16, bucket: &str, key: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }),
        429 | 500..=599 => Err(StorageError::Unavailable(format!(
            "storage returned HTTP {} for {}/{}",
            status, bucket, key
        ))),
        other => Err(StorageError::Rejected(other)),
    }
}

/// In-process object store, used by tests and local runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.get(bucket, key)
            .await
            .map(|o| o.data)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Storage rejected the request with HTTP {0}")]
    Rejected(u16),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    fn from_s3(err: S3Error, bucket: &str, key: &str) -> Self {
        match err {
            S3Error::HttpFailWithBody(status, _) => match check_status(status, bucket, key) {
                Err(e) => e,
                Ok(()) => StorageError::Unavailable(format!("unexpected HTTP {}", status)),
            },
            other => StorageError::Unavailable(other.to_string()),
        }
    }

    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(check_status(200, "b", "k").is_ok());
        assert!(matches!(check_status(404, "b", "k"), Err(StorageError::NotFound { .. })));
        assert!(matches!(check_status(403, "b", "k"), Err(StorageError::Rejected(403))));
        assert!(check_status(503, "b", "k").unwrap_err().is_retryable());
        assert!(check_status(429, "b", "k").unwrap_err().is_retryable());
        assert!(!check_status(400, "b", "k").unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        store.put_object("b", "k", b"data", "image/png").await.unwrap();
        assert_eq!(store.read_object("b", "k").await.unwrap(), b"data");
        assert_eq!(store.get("b", "k").await.unwrap().content_type, "image/png");
        assert!(matches!(
            store.read_object("b", "missing").await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
