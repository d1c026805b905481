use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::models::label::{Label, LabelResult};

/// A stored label set with its last write time.
#[derive(Debug, Clone)]
pub struct StoredLabels {
    pub result: LabelResult,
    pub updated_at: DateTime<Utc>,
}

/// Insert or replace the label set for an image in a single statement.
pub async fn upsert_labels(pool: &PgPool, result: &LabelResult) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO image_labels (image_key, labels, label_count, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (image_key) DO UPDATE
        SET labels = EXCLUDED.labels,
            label_count = EXCLUDED.label_count,
            updated_at = NOW()
        "#,
    )
    .bind(&result.image_key)
    .bind(Json(&result.labels))
    .bind(result.labels.len() as i32)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get the label set for an image
pub async fn get_labels(
    pool: &PgPool,
    image_key: &str,
) -> Result<Option<StoredLabels>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT image_key, labels, updated_at
        FROM image_labels
        WHERE image_key = $1
        "#,
    )
    .bind(image_key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<StoredLabels, sqlx::Error> {
        let labels: Json<Vec<Label>> = r.try_get("labels")?;
        Ok(StoredLabels {
            result: LabelResult::new(r.try_get::<String, _>("image_key")?, labels.0),
            updated_at: r.try_get("updated_at")?,
        })
    })
    .transpose()
}

/// Delete the label set for an image. Returns whether a row was removed.
pub async fn delete_labels(pool: &PgPool, image_key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM image_labels WHERE image_key = $1")
        .bind(image_key)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
