//! Ordered checkpoint writer in front of the persistence gateway.
//!
//! Every write goes through one queue drained by a single task, so checkpoints
//! land in the order they were issued. Fire-and-forget writes
//! ([`Checkpointer::submit`]) and awaited writes ([`Checkpointer::persist`])
//! share the queue: an awaited write also waits for every earlier one.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::db::{BatchRecord, DownloadsPersistence, FileRecord};
use crate::error::{Error, Result};
use crate::types::{BatchId, Status};

/// A single logical checkpoint
#[derive(Debug, Clone)]
pub enum Checkpoint {
    /// Batch row and all file rows
    Batch {
        /// Batch row
        batch: BatchRecord,
        /// File rows
        files: Vec<FileRecord>,
    },
    /// One file row
    File(FileRecord),
    /// Batch status only
    Status(BatchId, Status),
    /// Notification flag only
    NotificationSeen(BatchId, bool),
    /// Remove a batch and its files
    Delete(BatchId),
}

// `None` is a barrier: it only acknowledges once everything before it is stored.
type Job = (Option<Checkpoint>, Option<oneshot::Sender<Result<()>>>);

/// Serialising front-end of a [`DownloadsPersistence`]
#[derive(Clone)]
pub struct Checkpointer {
    persistence: Arc<dyn DownloadsPersistence>,
    tx: mpsc::UnboundedSender<Job>,
}

impl Checkpointer {
    /// Start the writer task; must be called within a tokio runtime
    pub fn new(persistence: Arc<dyn DownloadsPersistence>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&persistence), rx));
        Self { persistence, tx }
    }

    /// The gateway behind this writer, for reads
    pub fn persistence(&self) -> &Arc<dyn DownloadsPersistence> {
        &self.persistence
    }

    /// Queue a checkpoint without waiting for it
    pub fn submit(&self, checkpoint: Checkpoint) {
        if self.tx.send((Some(checkpoint), None)).is_err() {
            tracing::warn!("Checkpoint writer stopped, dropping checkpoint");
        }
    }

    /// Queue a checkpoint and wait until it and every earlier one is stored
    pub async fn persist(&self, checkpoint: Checkpoint) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((Some(checkpoint), Some(ack_tx)))
            .map_err(|_| Error::Other("checkpoint writer stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Other("checkpoint writer stopped".to_string()))?
    }

    /// Wait until every queued checkpoint is stored
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel::<Result<()>>();
        if self.tx.send((None, Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_writer(
    persistence: Arc<dyn DownloadsPersistence>,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some((checkpoint, ack)) = rx.recv().await {
        let result = match &checkpoint {
            Some(checkpoint) => apply(persistence.as_ref(), checkpoint).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            tracing::error!(error = %e, ?checkpoint, "Failed to store checkpoint");
        }
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
    }
    tracing::debug!("Checkpoint writer finished");
}

async fn apply(persistence: &dyn DownloadsPersistence, checkpoint: &Checkpoint) -> Result<()> {
    match checkpoint {
        Checkpoint::Batch { batch, files } => persistence.persist_batch(batch, files).await,
        Checkpoint::File(file) => persistence.persist_file(file).await,
        Checkpoint::Status(id, status) => persistence.update_status(id, *status).await,
        Checkpoint::NotificationSeen(id, seen) => {
            persistence.update_notification_seen(id, *seen).await
        }
        Checkpoint::Delete(id) => persistence.delete_batch(id).await,
    }
}
