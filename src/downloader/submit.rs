//! Batch submission and batch task spawning.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::batch::{BatchOutcome, DownloadBatch};
use crate::error::Result;
use crate::types::{Batch, Status};

use super::DownloadManager;

impl DownloadManager {
    /// Submit a batch for download
    ///
    /// The batch and its files are checkpointed before this returns. A batch
    /// whose id already has a live instance is ignored, so a batch is never
    /// driven twice at once.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ShuttingDown`] during shutdown, or the
    /// persistence error if the initial checkpoint could not be written.
    pub async fn submit(&self, batch: Batch) -> Result<()> {
        self.command_gate().await?;

        if self.lock_registry().batches.contains_key(batch.id()) {
            tracing::debug!(batch_id = %batch.id(), "Batch already live, ignoring submission");
            return Ok(());
        }

        let download_batch = Arc::new(self.factory.create(&batch));
        {
            let mut registry = self.lock_registry();
            if registry.batches.contains_key(batch.id()) {
                tracing::debug!(batch_id = %batch.id(), "Batch already live, ignoring submission");
                return Ok(());
            }
            registry
                .batches
                .insert(batch.id().clone(), Arc::clone(&download_batch));
        }

        if let Err(e) = download_batch.checkpoint_now().await {
            tracing::error!(batch_id = %batch.id(), error = %e, "Failed to checkpoint submitted batch");
            self.forget(&download_batch);
            return Err(e);
        }

        tracing::info!(
            batch_id = %batch.id(),
            title = batch.title(),
            files = batch.files().len(),
            "Batch submitted"
        );
        self.spawn_batch(download_batch);
        Ok(())
    }

    /// Drive `batch` on its own task once a batch slot is free
    ///
    /// At most one task exists per batch; a batch queued again while its task
    /// winds down is picked up by that task.
    pub(crate) fn spawn_batch(&self, batch: Arc<DownloadBatch>) {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return;
        }
        if !self.lock_registry().running.insert(batch.id().clone()) {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = match Arc::clone(&manager.batch_slots).acquire_owned().await {
                Ok(_permit) => batch.download().await,
                // Closed by shutdown
                Err(_) => BatchOutcome::Interrupted,
            };
            manager.handle_outcome(batch, outcome);
        });
    }

    fn handle_outcome(&self, batch: Arc<DownloadBatch>, outcome: BatchOutcome) {
        tracing::debug!(batch_id = %batch.id(), outcome = ?outcome, "Batch task ended");
        match &outcome {
            BatchOutcome::Deleted => self.forget(&batch),
            BatchOutcome::Downloaded => self.recovery.reset_backoff(),
            BatchOutcome::Failed(error) if error.is_network() => self.schedule_recovery(),
            BatchOutcome::WaitingForNetwork => self.schedule_recovery(),
            BatchOutcome::Failed(_)
            | BatchOutcome::Paused
            | BatchOutcome::Interrupted
            | BatchOutcome::Skipped => {}
        }

        self.lock_registry().running.remove(batch.id());
        if batch.status().status == Status::Queued {
            self.spawn_batch(batch);
        }
    }
}
