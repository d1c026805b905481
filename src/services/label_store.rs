use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::db::queries;
use crate::models::label::LabelResult;

/// Persistent label sets keyed by image key.
///
/// `save` is an upsert: the latest save for a key wholly replaces the prior
/// label set, and readers never observe a partially written set.
#[async_trait]
pub trait LabelStore: Send + Sync {
    async fn save(&self, result: &LabelResult) -> Result<(), StoreError>;

    async fn get(&self, image_key: &str) -> Result<Option<LabelResult>, StoreError>;

    /// Returns whether a label set existed.
    async fn delete(&self, image_key: &str) -> Result<bool, StoreError>;
}

fn validate_key(image_key: &str) -> Result<(), StoreError> {
    // Postgres text cannot hold NUL, so such a key could never be stored
    if image_key.trim().is_empty() || image_key.contains('\0') {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

/// PostgreSQL-backed label store (`image_labels` table).
pub struct PgLabelStore {
    pool: PgPool,
}

impl PgLabelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LabelStore for PgLabelStore {
    async fn save(&self, result: &LabelResult) -> Result<(), StoreError> {
        validate_key(&result.image_key)?;
        queries::upsert_labels(&self.pool, result).await?;
        Ok(())
    }

    async fn get(&self, image_key: &str) -> Result<Option<LabelResult>, StoreError> {
        validate_key(image_key)?;
        let stored = queries::get_labels(&self.pool, image_key).await?;
        Ok(stored.map(|s| s.result))
    }

    async fn delete(&self, image_key: &str) -> Result<bool, StoreError> {
        validate_key(image_key)?;
        Ok(queries::delete_labels(&self.pool, image_key).await?)
    }
}

/// In-process label store, used by tests and local runs.
#[derive(Default)]
pub struct MemoryLabelStore {
    results: RwLock<HashMap<String, LabelResult>>,
}

impl MemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl LabelStore for MemoryLabelStore {
    async fn save(&self, result: &LabelResult) -> Result<(), StoreError> {
        validate_key(&result.image_key)?;
        self.results
            .write()
            .await
            .insert(result.image_key.clone(), result.clone());
        Ok(())
    }

    async fn get(&self, image_key: &str) -> Result<Option<LabelResult>, StoreError> {
        validate_key(image_key)?;
        Ok(self.results.read().await.get(image_key).cloned())
    }

    async fn delete(&self, image_key: &str) -> Result<bool, StoreError> {
        validate_key(image_key)?;
        Ok(self.results.write().await.remove(image_key).is_some())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Label store unavailable: {0}")]
    Unavailable(String),

    #[error("Image key must be non-empty and free of NUL bytes")]
    InvalidKey,

    /// The database refused the data itself; repeating the write cannot help.
    #[error("Label store rejected the data: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let permanent = match &err {
            sqlx::Error::Encode(_) => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_data_error(&code)),
            _ => false,
        };
        if permanent {
            StoreError::Rejected(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint violation).
fn is_data_error(sqlstate: &str) -> bool {
    sqlstate.starts_with("22") || sqlstate.starts_with("23")
}
