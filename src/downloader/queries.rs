//! Status snapshots.

use crate::error::{Error, Result};
use crate::types::{BatchId, DownloadBatchStatus, DownloadFileStatus, FileId};

use super::DownloadManager;

impl DownloadManager {
    /// Current status of one batch
    pub async fn batch_status(&self, id: &BatchId) -> Result<DownloadBatchStatus> {
        self.wait_until_ready().await;
        Ok(self.live_batch(id)?.status())
    }

    /// Current status of every live batch, ordered by batch id
    pub async fn all_batch_statuses(&self) -> Vec<DownloadBatchStatus> {
        self.wait_until_ready().await;
        self.live_batches()
            .iter()
            .map(|batch| batch.status())
            .collect()
    }

    /// Current status of one file
    pub async fn file_status(
        &self,
        batch_id: &BatchId,
        file_id: &FileId,
    ) -> Result<DownloadFileStatus> {
        self.wait_until_ready().await;
        self.live_batch(batch_id)?
            .file_status(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {file_id} in batch {batch_id}")))
    }

    /// Current status of every file of a batch, in declaration order
    pub async fn file_statuses(&self, batch_id: &BatchId) -> Result<Vec<DownloadFileStatus>> {
        self.wait_until_ready().await;
        Ok(self.live_batch(batch_id)?.file_statuses())
    }
}
