//! Attachments repository
//!
//! PostgreSQL implementation of [`AttachmentStore`]. Every update is a
//! compare-and-swap on `lock_version`, so concurrent workers serialize on
//! the row without holding locks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use attachs_core::Id;
use attachs_lifecycle::{Attachment, AttachmentResult, AttachmentState, AttachmentStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::repository::{RepositoryError, RepositoryResult};

/// Mirrors `Lockable::next_lock_version`: restarts at 0 after `i32::MAX`
const NEXT_LOCK_VERSION: &str =
    "CASE WHEN lock_version = 2147483647 THEN 0 ELSE lock_version + 1 END";

const COLUMNS: &str = "id, owner_type, owner_id, owner_attribute, state, filename, \
     content_type, extension, size_bytes, requested_at, processed_at, \
     applied_styles, extras, lock_version";

/// Attachment row from database
#[derive(Debug, Clone, FromRow)]
pub struct AttachmentRow {
    pub id: i64,
    pub owner_type: String,
    pub owner_id: Option<i64>,
    pub owner_attribute: String,
    pub state: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub extension: Option<String>,
    pub size_bytes: Option<i64>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub applied_styles: Json<BTreeMap<String, Value>>,
    pub extras: Json<BTreeMap<String, Value>>,
    pub lock_version: i32,
}

impl TryFrom<AttachmentRow> for Attachment {
    type Error = RepositoryError;

    fn try_from(row: AttachmentRow) -> RepositoryResult<Self> {
        let state = AttachmentState::from_str(&row.state).ok_or_else(|| {
            RepositoryError::InvalidData(format!("unknown state '{}' for {}", row.state, row.id))
        })?;

        Ok(Attachment {
            id: Some(row.id),
            owner_type: row.owner_type,
            owner_id: row.owner_id,
            owner_attribute: row.owner_attribute,
            state,
            filename: row.filename,
            content_type: row.content_type,
            extension: row.extension,
            size_bytes: row.size_bytes,
            requested_at: row.requested_at,
            processed_at: row.processed_at,
            applied_styles: row.applied_styles.0,
            extras: row.extras.0,
            lock_version: row.lock_version,
        })
    }
}

fn into_attachments(rows: Vec<AttachmentRow>) -> RepositoryResult<Vec<Attachment>> {
    rows.into_iter().map(Attachment::try_from).collect()
}

/// Attachment repository
#[derive(Clone)]
pub struct PgAttachmentStore {
    pool: PgPool,
}

impl PgAttachmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, condition: &str) -> RepositoryResult<Vec<AttachmentRow>> {
        let sql = format!(
            "SELECT {} FROM attachments WHERE {} ORDER BY id",
            COLUMNS, condition
        );
        Ok(sqlx::query_as::<_, AttachmentRow>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert(&self, attachment: &Attachment) -> RepositoryResult<Id> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO attachments (
                owner_type, owner_id, owner_attribute, state, filename,
                content_type, extension, size_bytes, requested_at, processed_at,
                applied_styles, extras, lock_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0)
            RETURNING id
            "#,
        )
        .bind(&attachment.owner_type)
        .bind(attachment.owner_id)
        .bind(&attachment.owner_attribute)
        .bind(attachment.state.as_str())
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(&attachment.extension)
        .bind(attachment.size_bytes)
        .bind(attachment.requested_at)
        .bind(attachment.processed_at)
        .bind(Json(attachment.applied_styles.clone()))
        .bind(Json(attachment.extras.clone()))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn compare_and_swap(&self, attachment: &Attachment) -> RepositoryResult<Attachment> {
        let id = attachment
            .id
            .ok_or_else(|| RepositoryError::InvalidData("update of unsaved attachment".into()))?;

        let sql = format!(
            r#"
            UPDATE attachments SET
                owner_type = $3, owner_id = $4, owner_attribute = $5, state = $6,
                filename = $7, content_type = $8, extension = $9, size_bytes = $10,
                processed_at = $11, applied_styles = $12, extras = $13,
                lock_version = {}
            WHERE id = $1 AND lock_version = $2
            RETURNING {}
            "#,
            NEXT_LOCK_VERSION, COLUMNS
        );

        let row = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(id)
            .bind(attachment.lock_version)
            .bind(&attachment.owner_type)
            .bind(attachment.owner_id)
            .bind(&attachment.owner_attribute)
            .bind(attachment.state.as_str())
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(&attachment.extension)
            .bind(attachment.size_bytes)
            .bind(attachment.processed_at)
            .bind(Json(attachment.applied_styles.clone()))
            .bind(Json(attachment.extras.clone()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Attachment::try_from(row),
            None => {
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM attachments WHERE id = $1)",
                )
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

                if exists {
                    debug!(id = id, lock_version = attachment.lock_version, "Stale attachment write");
                    Err(RepositoryError::Conflict {
                        id,
                        lock_version: attachment.lock_version,
                    })
                } else {
                    Err(RepositoryError::NotFound(id))
                }
            }
        }
    }
}

#[async_trait]
impl AttachmentStore for PgAttachmentStore {
    async fn create(&self, attachment: &mut Attachment) -> AttachmentResult<Id> {
        let id = self.insert(attachment).await?;
        attachment.id = Some(id);
        attachment.lock_version = 0;
        Ok(id)
    }

    async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
        let sql = format!("SELECT {} FROM attachments WHERE id = $1", COLUMNS);
        let row = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.map(Attachment::try_from).transpose()?)
    }

    async fn update(&self, attachment: &Attachment) -> AttachmentResult<Attachment> {
        Ok(self.compare_and_swap(attachment).await?)
    }

    async fn delete(&self, id: Id) -> AttachmentResult<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_unattached(&self, id: Id) -> AttachmentResult<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = $1 AND owner_id IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_unattached_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> AttachmentResult<Vec<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachments WHERE owner_id IS NULL AND requested_at < $1 ORDER BY id",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(into_attachments(rows)?)
    }

    async fn find_processed(&self) -> AttachmentResult<Vec<Attachment>> {
        let rows = self.fetch_where("state = 'processed'").await?;
        Ok(into_attachments(rows)?)
    }

    async fn find_for_owner(
        &self,
        owner_type: &str,
        owner_id: Id,
        owner_attribute: Option<&str>,
    ) -> AttachmentResult<Vec<Attachment>> {
        let sql = format!(
            r#"
            SELECT {} FROM attachments
            WHERE owner_type = $1 AND owner_id = $2
              AND ($3::VARCHAR IS NULL OR owner_attribute = $3)
            ORDER BY id
            "#,
            COLUMNS
        );
        let rows = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(owner_type)
            .bind(owner_id)
            .bind(owner_attribute)
            .fetch_all(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(into_attachments(rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(state: &str) -> AttachmentRow {
        let requested_at = Utc::now();
        AttachmentRow {
            id: 12,
            owner_type: "User".to_string(),
            owner_id: Some(3),
            owner_attribute: "avatar".to_string(),
            state: state.to_string(),
            filename: Some("me.png".to_string()),
            content_type: Some("image/png".to_string()),
            extension: Some("png".to_string()),
            size_bytes: Some(2048),
            requested_at,
            processed_at: Some(requested_at + chrono::Duration::seconds(2)),
            applied_styles: Json(BTreeMap::from([(
                "thumb".to_string(),
                json!({"width": 100}),
            )])),
            extras: Json(BTreeMap::from([("width".to_string(), json!(640))])),
            lock_version: 4,
        }
    }

    #[test]
    fn test_row_into_attachment() {
        let attachment = Attachment::try_from(row("processed")).unwrap();

        assert_eq!(attachment.id, Some(12));
        assert!(attachment.is_processed());
        assert!(attachment.is_attached());
        assert_eq!(attachment.applied_styles["thumb"]["width"], 100);
        assert_eq!(attachment.extra("width"), Some(&json!(640)));
        assert_eq!(attachment.lock_version, 4);
        assert_eq!(attachment.metadata().unwrap().size_bytes, 2048);
    }

    #[test]
    fn test_lock_version_wraps_like_entity() {
        assert!(NEXT_LOCK_VERSION.contains(&i32::MAX.to_string()));
        assert!(NEXT_LOCK_VERSION.contains("THEN 0"));
        let row = Attachment::try_from(AttachmentRow {
            lock_version: i32::MAX,
            ..row("processed")
        })
        .unwrap();
        assert_eq!(attachs_core::Lockable::next_lock_version(&row), 0);
    }

    #[test]
    fn test_unknown_state_rejected() {
        let err = Attachment::try_from(row("done")).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidData(_)));
    }

    #[test]
    fn test_into_attachments_fails_on_any_bad_row() {
        assert_eq!(into_attachments(vec![row("uploading"), row("processing")]).unwrap().len(), 2);
        assert!(into_attachments(vec![row("uploading"), row("lost")]).is_err());
    }
}
