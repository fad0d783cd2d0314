//! The download manager, split into focused submodules.
//!
//! The `DownloadManager` struct and its methods are organized by domain:
//! - [`submit`] - Batch submission and batch task spawning
//! - [`control`] - Pause, resume, delete and notification acknowledgement
//! - [`connection_ops`] - Network policy and detected network changes
//! - [`lifecycle`] - Startup, restore from checkpoints, recovery and shutdown
//! - [`queries`] - Status snapshots
//! - [`callbacks`] - Status callback registry and fan-out

mod callbacks;
mod connection_ops;
mod control;
mod lifecycle;
mod queries;
mod submit;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use callbacks::CallbackId;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Semaphore, broadcast, mpsc, watch};

use crate::batch::{
    BatchFactory, Checkpointer, DownloadBatch, FileCollaborators, batch_rules_from_config,
};
use crate::config::Config;
use crate::connection::ConnectionChecker;
use crate::db::{Database, DownloadsPersistence};
use crate::error::{Error, Result};
use crate::network::{CompositeSizeRequester, HttpFileDownloaderCreator, http_client};
use crate::recovery::RecoveryScheduler;
use crate::storage::{LocalFilePersistenceCreator, storage_rules_from_config};
use crate::throttle::StatusCallback;
use crate::types::{BatchId, DownloadBatchStatus, NetworkType, Status};

/// Live batches and registered callbacks, guarded by one lock
///
/// The lock is never held while calling into a batch.
#[derive(Default)]
pub(crate) struct Registry {
    /// Live batches by id
    pub(crate) batches: HashMap<BatchId, Arc<DownloadBatch>>,
    /// Batches with a spawned task
    pub(crate) running: HashSet<BatchId>,
    /// Registered status callbacks, in registration order
    pub(crate) callbacks: Vec<(CallbackId, StatusCallback)>,
    pub(crate) next_callback_id: u64,
}

/// Main manager instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct DownloadManager {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Durable checkpoint store
    pub(crate) persistence: Arc<dyn DownloadsPersistence>,
    /// Ordered writer in front of `persistence`
    pub(crate) checkpointer: Checkpointer,
    /// Builds live batches from submissions and checkpoints
    pub(crate) factory: Arc<BatchFactory>,
    /// Network policy shared with every batch
    pub(crate) connection: Arc<ConnectionChecker>,
    /// Deferred resubmission after network failures
    pub(crate) recovery: Arc<RecoveryScheduler>,
    /// Live batches and callbacks
    pub(crate) registry: Arc<Mutex<Registry>>,
    /// Semaphore to limit concurrently downloading batches
    pub(crate) batch_slots: Arc<Semaphore>,
    /// Status broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<DownloadBatchStatus>,
    /// Opened once by [`DownloadManager::start`]
    pub(crate) ready: Arc<watch::Sender<bool>>,
    /// Flag to indicate whether commands are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl DownloadManager {
    /// Create a manager backed by SQLite, HTTP and the local filesystem
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Creates the download directory
    /// - Opens/creates the SQLite database and runs migrations
    /// - Builds the shared HTTP client and the default collaborators
    ///
    /// The manager accepts commands once [`DownloadManager::start`] has run.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.download_dir())
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download_dir().display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.persistence.database_path).await?;
        let client = http_client(config.download.request_timeout)?;
        let collaborators = FileCollaborators {
            size_requester: Arc::new(CompositeSizeRequester::http(
                client.clone(),
                config.download.request_timeout,
            )),
            downloader_creator: Arc::new(HttpFileDownloaderCreator::new(client)),
            persistence_creator: Arc::new(LocalFilePersistenceCreator::new(
                storage_rules_from_config(&config.storage),
            )),
        };
        let connection = Arc::new(ConnectionChecker::new(
            config.connection.allowed_connection_type,
            NetworkType::Unmetered,
        ));

        Self::with_collaborators(config, Arc::new(db), collaborators, connection)
    }

    /// Create a manager wired to caller-provided collaborators
    ///
    /// Must be called within a tokio runtime.
    pub fn with_collaborators(
        config: Config,
        persistence: Arc<dyn DownloadsPersistence>,
        collaborators: FileCollaborators,
        connection: Arc<ConnectionChecker>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(Mutex::new(Registry::default()));
        // Buffer of 1000 statuses per subscriber
        let (event_tx, _rx) = broadcast::channel(1000);

        // Batches report into one queue so callbacks run outside batch locks,
        // in the order statuses were produced
        let (status_tx, status_rx) = mpsc::unbounded_channel::<DownloadBatchStatus>();
        tokio::spawn(callbacks::dispatch(
            status_rx,
            Arc::downgrade(&registry),
            event_tx.clone(),
        ));
        let callback: StatusCallback = Arc::new(move |status: &DownloadBatchStatus| {
            let _ = status_tx.send(status.clone());
        });

        let checkpointer = Checkpointer::new(Arc::clone(&persistence));
        let factory = BatchFactory::new(
            &config,
            collaborators,
            batch_rules_from_config(&config.batch_rules),
            Arc::clone(&connection),
            checkpointer.clone(),
            callback,
        );
        let recovery = Arc::new(RecoveryScheduler::new(
            config.recovery.clone(),
            Arc::clone(&connection),
        ));
        let (ready, _rx) = watch::channel(false);

        tracing::info!(
            download_dir = %config.download_dir().display(),
            max_concurrent_batches = config.download.max_concurrent_batches,
            "Download manager created"
        );

        Ok(Self {
            batch_slots: Arc::new(Semaphore::new(config.download.max_concurrent_batches)),
            config: Arc::new(config),
            persistence,
            checkpointer,
            factory: Arc::new(factory),
            connection,
            recovery,
            registry,
            event_tx,
            ready: Arc::new(ready),
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Network policy shared with every batch
    pub fn connection(&self) -> &Arc<ConnectionChecker> {
        &self.connection
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until [`DownloadManager::start`] has opened the gate
    pub(crate) async fn wait_until_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`, so this only returns once ready
        let _ = ready.wait_for(|open| *open).await;
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.accepting_new.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Wait for readiness and reject commands during shutdown
    pub(crate) async fn command_gate(&self) -> Result<()> {
        self.wait_until_ready().await;
        self.ensure_accepting()
    }

    /// The live batch `id`; a deleted batch still awaiting removal counts as gone
    pub(crate) fn live_batch(&self, id: &BatchId) -> Result<Arc<DownloadBatch>> {
        let batch = self.lock_registry().batches.get(id).cloned();
        batch
            .filter(|batch| batch.status().status != Status::Deleted)
            .ok_or_else(|| Error::NotFound(format!("batch {id}")))
    }

    /// Every live batch, ordered by id
    pub(crate) fn live_batches(&self) -> Vec<Arc<DownloadBatch>> {
        let mut batches: Vec<_> = self.lock_registry().batches.values().cloned().collect();
        batches.retain(|batch| batch.status().status != Status::Deleted);
        batches.sort_by(|a, b| a.id().cmp(b.id()));
        batches
    }

    /// Drop `batch` from the registry unless another instance replaced it
    pub(crate) fn forget(&self, batch: &Arc<DownloadBatch>) {
        let mut registry = self.lock_registry();
        if registry
            .batches
            .get(batch.id())
            .is_some_and(|live| Arc::ptr_eq(live, batch))
        {
            registry.batches.remove(batch.id());
            tracing::debug!(batch_id = %batch.id(), "Batch removed from registry");
        }
    }
}
