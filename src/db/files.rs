//! File rows.

use sqlx::SqliteConnection;

use crate::error::DatabaseError;
use crate::types::BatchId;
use crate::{Error, Result};

use super::{Database, FileRecord};

impl Database {
    /// Insert or replace a file row, skipping files whose batch is gone
    pub async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;
        Self::upsert_file_in(&mut conn, file).await
    }

    pub(super) async fn upsert_file_in(conn: &mut SqliteConnection, file: &FileRecord) -> Result<()> {
        // The WHERE clause keeps a late checkpoint from resurrecting a deleted batch.
        sqlx::query(
            r#"
            INSERT INTO batch_files (
                batch_id, file_id, url, path, current_bytes,
                total_bytes, status, position
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM batches WHERE id = ?)
            ON CONFLICT(batch_id, file_id) DO UPDATE SET
                url = excluded.url,
                path = excluded.path,
                current_bytes = excluded.current_bytes,
                total_bytes = excluded.total_bytes,
                status = excluded.status,
                position = excluded.position
            "#,
        )
        .bind(&file.batch_id)
        .bind(&file.file_id)
        .bind(&file.url)
        .bind(&file.path)
        .bind(file.current_bytes)
        .bind(file.total_bytes)
        .bind(&file.status)
        .bind(file.position)
        .bind(&file.batch_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to persist file: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// List the files of a batch in declaration order
    pub async fn list_files(&self, batch_id: &BatchId) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT
                batch_id, file_id, url, path, current_bytes,
                total_bytes, status, position
            FROM batch_files
            WHERE batch_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(batch_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list files: {}",
                e
            )))
        })?;

        Ok(rows)
    }
}
