//! Startup, restore from checkpoints, recovery and shutdown coordination.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::batch::DownloadBatch;
use crate::error::Result;
use crate::types::{BatchId, Status};

use super::DownloadManager;

/// Upper bound on waiting for batch tasks during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl DownloadManager {
    /// Restore persisted batches and start accepting commands
    ///
    /// Commands issued before this completes wait for it. Calling `start`
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted batches cannot be read; the gate
    /// stays closed in that case.
    pub async fn start(&self) -> Result<()> {
        if *self.ready.borrow() {
            return Ok(());
        }
        let restored = self.restore_persisted().await?;
        self.ready.send_replace(true);
        tracing::info!(restored, "Download manager ready");
        Ok(())
    }

    /// Reconstruct persisted batches and resume the ones left mid-flight
    ///
    /// Batches that are already live are kept as they are. Returns the number
    /// of batches put back to work.
    pub async fn load_persisted_batches(&self) -> Result<usize> {
        self.command_gate().await?;
        self.restore_persisted().await
    }

    /// Re-submit every persisted batch that is not complete
    ///
    /// Queued, waiting and network-failed batches are driven again. This is
    /// what a recovery job runs once a permitted network is available.
    pub async fn resubmit_persisted(&self) -> Result<usize> {
        self.command_gate().await?;
        tracing::info!("Resubmitting persisted batches");
        self.restore_persisted().await
    }

    async fn restore_persisted(&self) -> Result<usize> {
        let records = self.persistence.load_batches().await?;
        let mut resumed = 0;

        for record in records {
            let id = match BatchId::new(&record.id) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(batch_id = %record.id, error = %e, "Skipping persisted batch");
                    continue;
                }
            };

            let existing = self.lock_registry().batches.get(&id).cloned();
            let batch = match existing {
                Some(batch) => batch,
                None => {
                    let files = self.persistence.load_files(&id).await?;
                    let rebuilt = match self.factory.reconstruct(&record, &files) {
                        Ok(batch) => Arc::new(batch),
                        Err(e) => {
                            tracing::warn!(batch_id = %id, error = %e, "Failed to reconstruct batch");
                            continue;
                        }
                    };
                    let mut registry = self.lock_registry();
                    Arc::clone(registry.batches.entry(id.clone()).or_insert(rebuilt))
                }
            };

            if batch.status().status == Status::Deleting {
                if batch.delete().await {
                    self.forget(&batch);
                }
                continue;
            }
            if self.resume_pending(&batch) {
                resumed += 1;
            }
        }

        tracing::info!(resumed, "Persisted batches restored");
        Ok(resumed)
    }

    /// Put a queued, waiting or network-failed batch back to work
    ///
    /// On a network that is not permitted the batch waits instead and a
    /// recovery job is scheduled.
    pub(crate) fn resume_pending(&self, batch: &Arc<DownloadBatch>) -> bool {
        let status = batch.status();
        let pending = match status.status {
            Status::Queued | Status::WaitingForNetwork => true,
            Status::Error => status.error.as_ref().is_some_and(|e| e.is_network()),
            _ => false,
        };
        if !pending {
            return false;
        }

        if !self.connection.is_allowed_to_download() {
            batch.wait_for_network();
            self.schedule_recovery();
            return false;
        }
        if status.status != Status::Queued && !batch.resume() {
            return false;
        }
        self.spawn_batch(Arc::clone(batch));
        true
    }

    /// Schedule a resubmission for when the network permits downloading
    pub(crate) fn schedule_recovery(&self) {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        self.recovery.schedule(move || async move {
            if let Err(e) = manager.resubmit_persisted().await {
                tracing::error!(error = %e, "Recovery resubmission failed");
            }
        });
    }

    /// Gracefully shut down the manager
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting commands
    /// 2. Stops running streams cooperatively, leaving their batches queued
    /// 3. Waits for batch tasks with a timeout (30 seconds)
    /// 4. Checkpoints the interrupted batches so they resume on next start
    /// 5. Cancels the pending recovery job and drains outstanding checkpoints
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.accepting_new.store(false, Ordering::SeqCst);

        let batches = self.live_batches();
        for batch in &batches {
            batch.interrupt();
        }
        self.batch_slots.close();

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_running_batches()).await {
            Ok(()) => tracing::info!("All batch tasks stopped"),
            Err(_) => {
                tracing::warn!("Timeout waiting for batch tasks, proceeding with shutdown")
            }
        }

        for batch in &batches {
            if matches!(batch.status().status, Status::Queued | Status::Downloading)
                && let Err(e) = batch.checkpoint_now().await
            {
                tracing::error!(batch_id = %batch.id(), error = %e, "Failed to checkpoint batch during shutdown");
            }
        }

        self.recovery.cancel_all().await;
        self.checkpointer.flush().await;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_running_batches(&self) {
        loop {
            let running = self.lock_registry().running.len();
            if running == 0 {
                return;
            }
            tracing::debug!(running, "Waiting for batch tasks to stop");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
