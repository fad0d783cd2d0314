//! Batch rows.

use crate::error::DatabaseError;
use crate::types::{BatchId, Status};
use crate::{Error, Result};

use super::{BatchRecord, Database, FileRecord};

impl Database {
    /// Insert or replace a batch and all of its files in one transaction
    ///
    /// `created_at` of an existing row is preserved. Files of the batch that are
    /// not in `files` are left untouched.
    pub async fn upsert_batch_with_files(
        &self,
        batch: &BatchRecord,
        files: &[FileRecord],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            INSERT INTO batches (
                id, title, status, downloaded_bytes, total_bytes,
                error_kind, error_message, notification_seen,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                downloaded_bytes = excluded.downloaded_bytes,
                total_bytes = excluded.total_bytes,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                notification_seen = excluded.notification_seen,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.title)
        .bind(&batch.status)
        .bind(batch.downloaded_bytes)
        .bind(batch.total_bytes)
        .bind(&batch.error_kind)
        .bind(&batch.error_message)
        .bind(batch.notification_seen)
        .bind(if batch.created_at > 0 { batch.created_at } else { now })
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to persist batch: {}",
                e
            )))
        })?;

        for file in files {
            Self::upsert_file_in(&mut tx, file).await?;
        }

        // Dropping the transaction without commit rolls it back.
        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit batch checkpoint: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// List all batches, oldest first
    pub async fn list_batches(&self) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query_as::<_, BatchRecord>(
            r#"
            SELECT
                id, title, status, downloaded_bytes, total_bytes,
                error_kind, error_message, notification_seen,
                created_at, updated_at
            FROM batches
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list batches: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Get a batch by ID
    pub async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, BatchRecord>(
            r#"
            SELECT
                id, title, status, downloaded_bytes, total_bytes,
                error_kind, error_message, notification_seen,
                created_at, updated_at
            FROM batches
            WHERE id = ?
            "#,
        )
        .bind(batch_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get batch: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Delete a batch; its files go with it through the cascade
    pub async fn remove_batch(&self, batch_id: &BatchId) -> Result<()> {
        sqlx::query("DELETE FROM batches WHERE id = ?")
            .bind(batch_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete batch: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Update the status of a batch
    pub async fn set_batch_status(&self, batch_id: &BatchId, status: Status) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE batches SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(batch_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update batch status: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Update the notification flag of a batch
    pub async fn set_notification_seen(&self, batch_id: &BatchId, seen: bool) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE batches SET notification_seen = ?, updated_at = ? WHERE id = ?")
            .bind(seen)
            .bind(now)
            .bind(batch_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update notification flag: {}",
                    e
                )))
            })?;

        Ok(())
    }
}
