//! Batch lifecycle control (pause/resume/delete).

use crate::error::Result;
use crate::types::BatchId;

use super::DownloadManager;

impl DownloadManager {
    /// Pause a batch, keeping every byte already on disk
    ///
    /// Pausing a batch that cannot be paused (already paused, downloaded,
    /// being deleted) is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no live batch has this id.
    pub async fn pause(&self, id: &BatchId) -> Result<()> {
        self.command_gate().await?;
        let batch = self.live_batch(id)?;
        if !batch.pause() {
            tracing::debug!(batch_id = %id, status = %batch.status().status, "Pause ignored");
        }
        Ok(())
    }

    /// Queue a paused, failed or waiting batch again
    ///
    /// Resuming a downloading or queued batch is a no-op. The batch continues
    /// from the bytes already on disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no live batch has this id.
    pub async fn resume(&self, id: &BatchId) -> Result<()> {
        self.command_gate().await?;
        let batch = self.live_batch(id)?;
        if batch.resume() {
            self.spawn_batch(batch);
        } else {
            tracing::debug!(batch_id = %id, status = %batch.status().status, "Resume ignored");
        }
        Ok(())
    }

    /// Delete a batch together with its files and checkpoints
    ///
    /// Running streams are stopped first. The batch reports `Deleted` as its
    /// last status and is then forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no live batch has this id.
    pub async fn delete(&self, id: &BatchId) -> Result<()> {
        self.command_gate().await?;
        let batch = self.live_batch(id)?;
        if batch.delete().await {
            self.forget(&batch);
        }
        Ok(())
    }

    /// Acknowledge the completion notification of a batch
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no live batch has this id.
    pub async fn mark_notification_seen(&self, id: &BatchId) -> Result<()> {
        self.command_gate().await?;
        self.live_batch(id)?.mark_notification_seen();
        Ok(())
    }
}
