//! Durable checkpoints of batches and their files.
//!
//! [`DownloadsPersistence`] is the gateway contract the engine checkpoints
//! through. Each method is one logical checkpoint and is applied atomically.
//!
//! ## Implementations
//!
//! - [`Database`] - SQLite via sqlx, methods organized by domain:
//!   - [`migrations`] - Database lifecycle, schema migrations
//!   - [`batches`] - Batch rows
//!   - [`files`] - File rows
//! - [`MemoryPersistence`] - in-process maps, for tests and ephemeral use

use async_trait::async_trait;
use sqlx::{FromRow, sqlite::SqlitePool};

use crate::error::Result;
use crate::types::{BatchId, Status};

mod batches;
mod files;
mod memory;
mod migrations;

pub use memory::MemoryPersistence;

/// Persisted form of a batch
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BatchRecord {
    /// Batch identifier
    pub id: String,
    /// Display title
    pub title: String,
    /// Lifecycle state as stored (see [`Status::as_str`])
    pub status: String,
    /// Sum of persisted bytes at the last checkpoint
    pub downloaded_bytes: i64,
    /// Sum of file totals, `<= 0` while unknown
    pub total_bytes: i64,
    /// Error kind (see [`crate::types::DownloadErrorKind::as_str`])
    pub error_kind: Option<String>,
    /// Error message
    pub error_message: Option<String>,
    /// Whether the completion notification was acknowledged
    pub notification_seen: bool,
    /// Unix timestamp of the first checkpoint
    pub created_at: i64,
    /// Unix timestamp of the latest checkpoint
    pub updated_at: i64,
}

/// Persisted form of a file within a batch
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct FileRecord {
    /// Owning batch
    pub batch_id: String,
    /// File identifier
    pub file_id: String,
    /// Network address
    pub url: String,
    /// Absolute local path
    pub path: String,
    /// Bytes persisted at the last checkpoint
    pub current_bytes: i64,
    /// Total size, `<= 0` while unknown
    pub total_bytes: i64,
    /// Lifecycle state (see [`crate::types::FileStatus::as_str`])
    pub status: String,
    /// Declaration order within the batch
    pub position: i64,
}

/// Gateway to the durable metadata store
///
/// Implementations must apply each call atomically: either every row a call
/// touches is written, or none is.
#[async_trait]
pub trait DownloadsPersistence: Send + Sync {
    /// Insert or replace a batch together with all of its files
    async fn persist_batch(&self, batch: &BatchRecord, files: &[FileRecord]) -> Result<()>;

    /// All persisted batches, oldest first
    async fn load_batches(&self) -> Result<Vec<BatchRecord>>;

    /// Files of one batch in declaration order
    async fn load_files(&self, batch_id: &BatchId) -> Result<Vec<FileRecord>>;

    /// Insert or replace one file row; ignored if its batch no longer exists
    async fn persist_file(&self, file: &FileRecord) -> Result<()>;

    /// Remove a batch and its files
    async fn delete_batch(&self, batch_id: &BatchId) -> Result<()>;

    /// Change the stored status of a batch
    async fn update_status(&self, batch_id: &BatchId, status: Status) -> Result<()>;

    /// Change the stored notification flag of a batch
    async fn update_notification_seen(&self, batch_id: &BatchId, seen: bool) -> Result<()>;
}

/// SQLite handle for batch-dl
pub struct Database {
    pool: SqlitePool,
}

#[async_trait]
impl DownloadsPersistence for Database {
    async fn persist_batch(&self, batch: &BatchRecord, files: &[FileRecord]) -> Result<()> {
        self.upsert_batch_with_files(batch, files).await
    }

    async fn load_batches(&self) -> Result<Vec<BatchRecord>> {
        self.list_batches().await
    }

    async fn load_files(&self, batch_id: &BatchId) -> Result<Vec<FileRecord>> {
        self.list_files(batch_id).await
    }

    async fn persist_file(&self, file: &FileRecord) -> Result<()> {
        self.upsert_file(file).await
    }

    async fn delete_batch(&self, batch_id: &BatchId) -> Result<()> {
        self.remove_batch(batch_id).await
    }

    async fn update_status(&self, batch_id: &BatchId, status: Status) -> Result<()> {
        self.set_batch_status(batch_id, status).await
    }

    async fn update_notification_seen(&self, batch_id: &BatchId, seen: bool) -> Result<()> {
        self.set_notification_seen(batch_id, seen).await
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
