use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;

use crate::models::label::ThumbnailRef;
use crate::services::storage::{ObjectStore, StorageError};

#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailSettings {
    /// Bucket thumbnails are written to.
    pub bucket: String,
    /// Key prefix prepended to the source key.
    pub prefix: String,
    /// Longest edge of the generated thumbnail, in pixels.
    pub max_dimension: u32,
}

/// Writes a bounded-size JPEG derivative of a source image.
///
/// The output key is a pure function of the source key, so regenerating
/// overwrites the previous thumbnail instead of adding another one.
pub struct ThumbnailGenerator {
    storage: Arc<dyn ObjectStore>,
    settings: ThumbnailSettings,
}

impl ThumbnailGenerator {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        settings: ThumbnailSettings,
    ) -> Result<Self, ThumbnailError> {
        if settings.bucket.is_empty() {
            return Err(ThumbnailError::Config("thumbnail bucket is empty".to_string()));
        }
        if settings.max_dimension == 0 {
            return Err(ThumbnailError::Config(
                "thumbnail max dimension must be positive".to_string(),
            ));
        }
        Ok(Self { storage, settings })
    }

    /// Destination key for a source key.
    pub fn output_key(&self, key: &str) -> String {
        format!("{}{}", self.settings.prefix, key)
    }

    pub async fn generate(&self, bucket: &str, key: &str) -> Result<ThumbnailRef, ThumbnailError> {
        let output_key = self.output_key(key);
        if bucket == self.settings.bucket && output_key == key {
            return Err(ThumbnailError::Config(format!(
                "thumbnail for {}/{} would overwrite its source",
                bucket, key
            )));
        }

        let source = self.storage.read_object(bucket, key).await?;

        let max_dimension = self.settings.max_dimension;
        let (encoded, width, height) =
            tokio::task::spawn_blocking(move || render_thumbnail(&source, max_dimension))
                .await
                .map_err(|e| ThumbnailError::Unavailable(format!("resize task failed: {}", e)))??;

        self.storage
            .put_object(&self.settings.bucket, &output_key, &encoded, "image/jpeg")
            .await?;

        Ok(ThumbnailRef {
            bucket: self.settings.bucket.clone(),
            key: output_key,
            width,
            height,
        })
    }
}

/// Decode, shrink (aspect preserved, never upscaled) and re-encode as JPEG.
fn render_thumbnail(source: &[u8], max_dimension: u32) -> Result<(Vec<u8>, u32, u32), ThumbnailError> {
    let img = image::load_from_memory(source)
        .map_err(|e| ThumbnailError::InvalidImage(e.to_string()))?;

    let thumb = if img.width() > max_dimension || img.height() > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());
    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .map_err(|e| ThumbnailError::InvalidImage(e.to_string()))?;

    Ok((out, rgb.width(), rgb.height()))
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("Thumbnail target unavailable: {0}")]
    Unavailable(String),

    #[error("Source is not a usable image: {0}")]
    InvalidImage(String),

    #[error("Thumbnail configuration error: {0}")]
    Config(String),
}

impl From<StorageError> for ThumbnailError {
    fn from(err: StorageError) -> Self {
        if err.is_retryable() {
            ThumbnailError::Unavailable(err.to_string())
        } else {
            ThumbnailError::InvalidImage(err.to_string())
        }
    }
}
