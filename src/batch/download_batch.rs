//! State machine of a batch and the driver of its files.

use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::checkpoint::{Checkpoint, Checkpointer};
use super::file::DownloadFile;
use super::rules::DownloadBatchRequirementRule;
use crate::config::FileDownloadMode;
use crate::connection::ConnectionChecker;
use crate::db::{BatchRecord, FileRecord};
use crate::error::Result;
use crate::throttle::CallbackThrottle;
use crate::types::{
    BatchId, DownloadBatchStatus, DownloadError, DownloadErrorKind, DownloadFileStatus, FileId,
    FileStatus, Status,
};

/// How a call to [`DownloadBatch::download`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every file is on disk
    Downloaded,
    /// Paused by the client
    Paused,
    /// Deleted; the batch must be forgotten
    Deleted,
    /// Stopped with an error
    Failed(DownloadError),
    /// Held until a permitted network is available
    WaitingForNetwork,
    /// Stopped by shutdown and left queued
    Interrupted,
    /// Not queued, or already being driven elsewhere
    Skipped,
}

pub(crate) struct BatchParts {
    pub status: DownloadBatchStatus,
    pub created_at: i64,
    pub directory: PathBuf,
    pub files: Vec<DownloadFile>,
    pub mode: FileDownloadMode,
    pub rules: Arc<Vec<Arc<dyn DownloadBatchRequirementRule>>>,
    pub connection: Arc<ConnectionChecker>,
    pub throttle: Arc<dyn CallbackThrottle>,
    pub checkpointer: Checkpointer,
}

struct BatchState {
    status: DownloadBatchStatus,
    file_bytes: HashMap<FileId, i64>,
    created_at: i64,
    // A `download` call owns the batch
    running: bool,
    // Deleted was emitted; nothing may follow it
    deleted: bool,
}

/// A group of files downloaded and tracked together
///
/// Statuses reach the batch's [`CallbackThrottle`] while the state lock is
/// held, so callbacks observe them in the order the transitions happened.
pub struct DownloadBatch {
    id: BatchId,
    directory: PathBuf,
    files: Vec<DownloadFile>,
    mode: FileDownloadMode,
    rules: Arc<Vec<Arc<dyn DownloadBatchRequirementRule>>>,
    connection: Arc<ConnectionChecker>,
    throttle: Arc<dyn CallbackThrottle>,
    checkpointer: Checkpointer,
    state: Mutex<BatchState>,
    interrupted: AtomicBool,
}

impl DownloadBatch {
    pub(crate) fn new(parts: BatchParts) -> Self {
        let file_bytes = parts
            .files
            .iter()
            .map(|file| (file.file_id().clone(), file.file_size().current_bytes))
            .collect();
        Self {
            id: parts.status.batch_id.clone(),
            directory: parts.directory,
            files: parts.files,
            mode: parts.mode,
            rules: parts.rules,
            connection: parts.connection,
            throttle: parts.throttle,
            checkpointer: parts.checkpointer,
            state: Mutex::new(BatchState {
                status: parts.status,
                file_bytes,
                created_at: parts.created_at,
                running: false,
                deleted: false,
            }),
            interrupted: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &BatchState) {
        if !state.deleted {
            self.throttle.update(&state.status);
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Batch identifier
    pub fn id(&self) -> &BatchId {
        &self.id
    }

    /// Current aggregate status
    pub fn status(&self) -> DownloadBatchStatus {
        self.lock_state().status.clone()
    }

    /// Snapshots of every file, in declaration order
    pub fn file_statuses(&self) -> Vec<DownloadFileStatus> {
        self.files.iter().map(|file| file.status()).collect()
    }

    /// Snapshot of one file
    pub fn file_status(&self, file_id: &FileId) -> Option<DownloadFileStatus> {
        self.files
            .iter()
            .find(|file| file.file_id() == file_id)
            .map(|file| file.status())
    }

    pub(crate) fn record(&self) -> BatchRecord {
        let state = self.lock_state();
        let status = &state.status;
        BatchRecord {
            id: self.id.as_str().to_string(),
            title: status.title.clone(),
            status: status.status.as_str().to_string(),
            downloaded_bytes: status.bytes_downloaded,
            total_bytes: status.bytes_total,
            error_kind: status.error.as_ref().map(|e| e.kind.as_str().to_string()),
            error_message: status.error.as_ref().map(|e| e.message.clone()),
            notification_seen: status.notification_seen,
            created_at: state.created_at,
            updated_at: 0,
        }
    }

    pub(crate) fn record_files(&self) -> Vec<FileRecord> {
        self.files.iter().map(|file| file.record()).collect()
    }

    fn full_checkpoint(&self) -> Checkpoint {
        Checkpoint::Batch {
            batch: self.record(),
            files: self.record_files(),
        }
    }

    /// Store the batch and all of its files, waiting for the write
    pub(crate) async fn checkpoint_now(&self) -> Result<()> {
        self.checkpointer.persist(self.full_checkpoint()).await
    }

    /// Drive a queued batch to a resting state
    ///
    /// Files are downloaded per the configured [`FileDownloadMode`]. Terminal
    /// statuses are checkpointed before they are reported. A batch resumed
    /// while its run is winding down is driven again by the same call.
    pub async fn download(&self) -> BatchOutcome {
        {
            let mut state = self.lock_state();
            if state.running || state.status.status != Status::Queued {
                return BatchOutcome::Skipped;
            }
            state.running = true;
        }

        loop {
            let outcome = self.run().await;
            let next = {
                let mut state = self.lock_state();
                if state.status.status == Status::Queued && !self.is_interrupted() {
                    None
                } else {
                    state.running = false;
                    Some(state.status.status == Status::Deleting)
                }
            };
            match next {
                None => continue,
                Some(true) => {
                    self.complete_deletion().await;
                    return BatchOutcome::Deleted;
                }
                Some(false) => return outcome,
            }
        }
    }

    async fn run(&self) -> BatchOutcome {
        {
            let mut state = self.lock_state();
            if state.status.status != Status::Queued || self.is_interrupted() {
                return self.outcome_of(&state.status);
            }
            state.status.status = Status::Downloading;
            state.status.error = None;
        }
        tracing::info!(batch_id = %self.id, files = self.files.len(), "Batch download started");

        if let Err(e) = self
            .checkpointer
            .persist(Checkpoint::Status(self.id.clone(), Status::Downloading))
            .await
        {
            tracing::error!(batch_id = %self.id, error = %e, "Failed to checkpoint batch start");
        }
        self.publish(&self.lock_state());

        let mut total = 0i64;
        for file in &self.files {
            if !self.can_continue() {
                return self.finish_run().await;
            }
            let size = file.ensure_total_size().await;
            if size <= 0 {
                tracing::warn!(batch_id = %self.id, file_id = %file.file_id(), "File size unavailable");
                return self
                    .fail_run(DownloadError::new(
                        DownloadErrorKind::NetworkError,
                        "cannot download file",
                    ))
                    .await;
            }
            total += size;
        }

        let sizes: Vec<(FileId, i64)> = self
            .files
            .iter()
            .map(|file| (file.file_id().clone(), file.file_size().current_bytes))
            .collect();
        let snapshot = {
            let mut state = self.lock_state();
            state.file_bytes = sizes.into_iter().collect();
            let downloaded = state.file_bytes.values().sum();
            state.status.set_bytes(downloaded, total);
            self.publish(&state);
            state.status.clone()
        };

        if let Some(rule) = self.rules.iter().find(|rule| rule.has_violated_rule(&snapshot)) {
            return self
                .fail_run(DownloadError::new(
                    DownloadErrorKind::RequirementRuleViolated,
                    rule.describe(),
                ))
                .await;
        }
        self.checkpointer.submit(self.full_checkpoint());

        self.drive_files().await;
        self.finish_run().await
    }

    async fn drive_files(&self) {
        let progress = |status: &DownloadFileStatus| self.on_file_progress(status);
        match self.mode {
            FileDownloadMode::Sequential => {
                for file in &self.files {
                    if !self.can_continue() {
                        break;
                    }
                    file.download(&progress).await;
                }
            }
            FileDownloadMode::Concurrent {
                max_concurrent_files,
            } => {
                futures::stream::iter(&self.files)
                    .for_each_concurrent(max_concurrent_files.max(1), |file| {
                        let progress = &progress;
                        async move {
                            if self.can_continue() {
                                file.download(progress).await;
                            }
                        }
                    })
                    .await;
            }
        }
    }

    fn can_continue(&self) -> bool {
        !self.is_interrupted()
            && self.lock_state().status.status == Status::Downloading
            && self.connection.is_allowed_to_download()
    }

    fn on_file_progress(&self, file: &DownloadFileStatus) {
        let mut state = self.lock_state();
        if state.deleted {
            return;
        }
        state
            .file_bytes
            .insert(file.file_id.clone(), file.file_size.current_bytes);
        let downloaded = state.file_bytes.values().sum();
        let total = state.status.bytes_total;
        state.status.set_bytes(downloaded, total);

        // The most recently reported file error wins
        if file.status == FileStatus::Error
            && matches!(state.status.status, Status::Downloading | Status::Error)
            && let Some(error) = &file.error
        {
            state.status.status = Status::Error;
            state.status.error = Some(error.clone());
        }
        self.publish(&state);
    }

    async fn fail_run(&self, error: DownloadError) -> BatchOutcome {
        {
            let mut state = self.lock_state();
            if state.status.status == Status::Downloading {
                state.status.status = Status::Error;
                state.status.error = Some(error);
            }
        }
        self.finish_run().await
    }

    async fn finish_run(&self) -> BatchOutcome {
        let files = self.file_statuses();
        let network_allowed = self.connection.is_allowed_to_download();
        let terminal = {
            let mut state = self.lock_state();
            if state.status.status == Status::Downloading && !self.is_interrupted() {
                if files.iter().all(|f| f.status == FileStatus::Downloaded) {
                    state.status.status = Status::Downloaded;
                    state.status.error = None;
                } else if !network_allowed
                    || files.iter().any(|f| f.status == FileStatus::WaitingForNetwork)
                {
                    state.status.status = Status::WaitingForNetwork;
                } else {
                    state.status.status = Status::Error;
                    state.status.error = Some(
                        files.iter().find_map(|f| f.error.clone()).unwrap_or_else(|| {
                            DownloadError::new(
                                DownloadErrorKind::Unknown,
                                "download stopped before completion",
                            )
                        }),
                    );
                }
            }
            matches!(
                state.status.status,
                Status::Downloaded | Status::Error | Status::WaitingForNetwork
            )
        };

        if terminal && let Err(e) = self.checkpoint_now().await {
            tracing::error!(batch_id = %self.id, error = %e, "Failed to checkpoint batch");
        }

        let status = {
            let state = self.lock_state();
            if terminal {
                self.publish(&state);
            }
            state.status.clone()
        };
        self.throttle.stop_updates();

        tracing::info!(
            batch_id = %self.id,
            status = %status.status,
            bytes = status.bytes_downloaded,
            total = status.bytes_total,
            "Batch download ended"
        );
        self.outcome_of(&status)
    }

    fn outcome_of(&self, status: &DownloadBatchStatus) -> BatchOutcome {
        match status.status {
            Status::Downloaded => BatchOutcome::Downloaded,
            Status::Paused => BatchOutcome::Paused,
            Status::Deleting | Status::Deleted => BatchOutcome::Deleted,
            Status::Error => BatchOutcome::Failed(status.error.clone().unwrap_or_else(|| {
                DownloadError::new(DownloadErrorKind::Unknown, "unknown error")
            })),
            Status::WaitingForNetwork => BatchOutcome::WaitingForNetwork,
            Status::Queued | Status::Downloading if self.is_interrupted() => {
                BatchOutcome::Interrupted
            }
            Status::Queued | Status::Downloading => BatchOutcome::Skipped,
        }
    }

    /// Pause the batch and its files; bytes on disk are kept
    ///
    /// Returns `false` if the batch cannot be paused from its current status.
    pub fn pause(&self) -> bool {
        {
            let mut state = self.lock_state();
            if !state.status.status.can_transition_to(Status::Paused) {
                return false;
            }
            state.status.status = Status::Paused;
            self.publish(&state);
        }
        for file in &self.files {
            file.pause();
        }
        self.checkpointer
            .submit(Checkpoint::Status(self.id.clone(), Status::Paused));
        tracing::info!(batch_id = %self.id, "Batch paused");
        true
    }

    /// Queue a paused, failed or waiting batch again
    ///
    /// Returns whether the batch is queued afterwards.
    pub fn resume(&self) -> bool {
        {
            let mut state = self.lock_state();
            match state.status.status {
                Status::Paused | Status::Error | Status::WaitingForNetwork => {
                    state.status.status = Status::Queued;
                    state.status.error = None;
                    self.publish(&state);
                }
                other => return other == Status::Queued,
            }
        }
        for file in &self.files {
            file.resume();
        }
        self.checkpointer.submit(self.full_checkpoint());
        tracing::info!(batch_id = %self.id, "Batch queued");
        true
    }

    /// Hold the batch until a permitted network is available
    ///
    /// Applies to queued and downloading batches, and to batches that failed
    /// because of the network.
    pub fn wait_for_network(&self) -> bool {
        {
            let mut state = self.lock_state();
            let applies = match state.status.status {
                Status::Queued | Status::Downloading => true,
                Status::Error => state.status.error.as_ref().is_some_and(|e| e.is_network()),
                _ => false,
            };
            if !applies {
                return false;
            }
            state.status.status = Status::WaitingForNetwork;
            state.status.error = None;
            self.publish(&state);
        }
        for file in &self.files {
            file.wait_for_network();
        }
        self.checkpointer
            .submit(Checkpoint::Status(self.id.clone(), Status::WaitingForNetwork));
        tracing::info!(batch_id = %self.id, "Batch waiting for network");
        true
    }

    /// Start deleting the batch
    ///
    /// Returns `true` when deletion completed within the call; otherwise the
    /// running `download` call completes it once its streams have stopped.
    /// A batch restored while deleting finishes its deletion here.
    pub async fn delete(&self) -> bool {
        let running = {
            let mut state = self.lock_state();
            match state.status.status {
                Status::Deleted => return false,
                Status::Deleting if state.running => return false,
                Status::Deleting => {}
                _ => {
                    state.status.status = Status::Deleting;
                    self.publish(&state);
                    self.checkpointer
                        .submit(Checkpoint::Status(self.id.clone(), Status::Deleting));
                }
            }
            state.running
        };
        tracing::info!(batch_id = %self.id, "Deleting batch");
        for file in &self.files {
            file.delete();
        }
        if running {
            return false;
        }
        self.complete_deletion().await;
        true
    }

    async fn complete_deletion(&self) {
        if let Err(e) = self
            .checkpointer
            .persist(Checkpoint::Delete(self.id.clone()))
            .await
        {
            tracing::error!(batch_id = %self.id, error = %e, "Failed to delete batch checkpoint");
        }
        match tokio::fs::remove_dir_all(&self.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                batch_id = %self.id,
                path = %self.directory.display(),
                error = %e,
                "Failed to remove batch directory"
            ),
        }

        let mut state = self.lock_state();
        if state.deleted {
            return;
        }
        state.status.status = Status::Deleted;
        self.throttle.update(&state.status);
        self.throttle.stop_updates();
        state.deleted = true;
        tracing::info!(batch_id = %self.id, "Batch deleted");
    }

    /// Stop a running batch for shutdown, leaving it queued
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let was_downloading = {
            let mut state = self.lock_state();
            let downloading = state.status.status == Status::Downloading;
            if downloading {
                state.status.status = Status::Queued;
            }
            downloading
        };
        if was_downloading {
            for file in &self.files {
                file.pause();
            }
        }
    }

    /// Flag the completion notification as seen
    pub fn mark_notification_seen(&self) {
        self.lock_state().status.notification_seen = true;
        self.checkpointer
            .submit(Checkpoint::NotificationSeen(self.id.clone(), true));
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::factory::BatchFactory;
    use crate::batch::rules::MaxBatchSizeRule;
    use crate::batch::test_helpers::{FakeNetwork, collaborators};
    use crate::config::{Config, ThrottleMode};
    use crate::db::{DownloadsPersistence, MemoryPersistence};
    use crate::storage::StorageRequirementRule;
    use crate::throttle::StatusCallback;
    use crate::utils::DiskSpace;
    use crate::types::{Batch, ConnectionType, NetworkType};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        network: Arc<FakeNetwork>,
        memory: Arc<MemoryPersistence>,
        connection: Arc<ConnectionChecker>,
        seen: Arc<Mutex<Vec<DownloadBatchStatus>>>,
        factory: BatchFactory,
    }

    impl Harness {
        fn new(
            network: Arc<FakeNetwork>,
            mode: FileDownloadMode,
            rules: Vec<Arc<dyn DownloadBatchRequirementRule>>,
        ) -> Self {
            Self::with_options(network, mode, rules, Vec::new(), ThrottleMode::Unthrottled)
        }

        fn with_options(
            network: Arc<FakeNetwork>,
            mode: FileDownloadMode,
            rules: Vec<Arc<dyn DownloadBatchRequirementRule>>,
            storage_rules: Vec<Arc<dyn StorageRequirementRule>>,
            throttle: ThrottleMode,
        ) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.download.download_dir = dir.path().to_path_buf();
            config.download.file_download_mode = mode;
            config.throttle.mode = throttle;

            let memory = Arc::new(MemoryPersistence::new());
            let connection = Arc::new(ConnectionChecker::new(
                ConnectionType::All,
                NetworkType::Unmetered,
            ));
            let seen = Arc::new(Mutex::new(Vec::new()));
            let callback: StatusCallback = {
                let seen = Arc::clone(&seen);
                Arc::new(move |status: &DownloadBatchStatus| {
                    seen.lock().unwrap().push(status.clone())
                })
            };
            let factory = BatchFactory::new(
                &config,
                collaborators(&network, storage_rules),
                rules,
                Arc::clone(&connection),
                Checkpointer::new(memory.clone()),
                callback,
            );
            Self {
                dir,
                network,
                memory,
                connection,
                seen,
                factory,
            }
        }

        fn statuses(&self) -> Vec<Status> {
            self.seen.lock().unwrap().iter().map(|s| s.status).collect()
        }
    }

    fn two_file_batch() -> Batch {
        Batch::builder("b1", "Two files")
            .add_file("https://host/one.bin")
            .add_file("https://host/two.bin")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn downloads_all_files_sequentially() {
        let network = FakeNetwork::new();
        network.serve("https://host/one.bin", vec![1u8; 300]);
        network.serve("https://host/two.bin", vec![2u8; 100]);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());

        assert_eq!(batch.download().await, BatchOutcome::Downloaded);

        let status = batch.status();
        assert_eq!(status.status, Status::Downloaded);
        assert_eq!((status.bytes_downloaded, status.bytes_total), (400, 400));
        assert_eq!(status.percentage, 100);
        assert_eq!(h.statuses().first(), Some(&Status::Downloading));
        assert_eq!(h.statuses().last(), Some(&Status::Downloaded));
        assert_eq!(
            std::fs::read(h.dir.path().join("b1/two.bin")).unwrap(),
            vec![2u8; 100]
        );

        let stored = h.memory.load_batches().await.unwrap();
        assert_eq!(stored[0].status, "downloaded");
        assert_eq!(stored[0].downloaded_bytes, 400);
    }

    #[tokio::test]
    async fn downloads_files_concurrently() {
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(1));
        network.serve("https://host/one.bin", vec![1u8; 500]);
        network.serve("https://host/two.bin", vec![2u8; 500]);
        let h = Harness::new(
            network,
            FileDownloadMode::Concurrent {
                max_concurrent_files: 2,
            },
            Vec::new(),
        );
        let batch = h.factory.create(&two_file_batch());

        assert_eq!(batch.download().await, BatchOutcome::Downloaded);
        assert!(
            batch
                .file_statuses()
                .iter()
                .all(|f| f.status == FileStatus::Downloaded)
        );
    }

    #[tokio::test]
    async fn percentages_never_decrease() {
        let network = FakeNetwork::new();
        network.serve("https://host/one.bin", vec![1u8; 1000]);
        network.serve("https://host/two.bin", vec![2u8; 1000]);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());

        batch.download().await;

        let seen = h.seen.lock().unwrap();
        let percentages: Vec<u8> = seen.iter().map(|s| s.percentage).collect();
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "{percentages:?}");
        assert!(seen.iter().all(|s| s.bytes_downloaded <= 2000));
    }

    #[tokio::test]
    async fn unknown_file_size_fails_whole_batch() {
        let network = FakeNetwork::new();
        network.serve("https://host/one.bin", vec![1u8; 10]);
        network.serve_without_size("https://host/two.bin", vec![2u8; 10]);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());

        let outcome = batch.download().await;

        let BatchOutcome::Failed(error) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(error.kind, DownloadErrorKind::NetworkError);
        assert_eq!(error.message, "cannot download file");
        assert!(!h.dir.path().join("b1/one.bin").exists());
        assert_eq!(h.memory.load_batches().await.unwrap()[0].status, "error");
    }

    #[tokio::test]
    async fn violated_batch_rule_fails_before_streaming() {
        let network = FakeNetwork::new();
        network.serve("https://host/one.bin", vec![1u8; 300]);
        network.serve("https://host/two.bin", vec![2u8; 300]);
        let h = Harness::new(
            network,
            FileDownloadMode::Sequential,
            vec![Arc::new(MaxBatchSizeRule::new(500))],
        );
        let batch = h.factory.create(&two_file_batch());

        let BatchOutcome::Failed(error) = batch.download().await else {
            panic!("expected failure");
        };
        assert_eq!(error.kind, DownloadErrorKind::RequirementRuleViolated);
        assert!(h.network.stream_offsets("https://host/one.bin").is_empty());
    }

    #[tokio::test]
    async fn file_error_stops_sequential_batch() {
        let network = FakeNetwork::new();
        network.serve("https://host/one.bin", vec![1u8; 300]);
        network.serve("https://host/two.bin", vec![2u8; 300]);
        network.fail_after("https://host/one.bin", 100);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());

        let BatchOutcome::Failed(error) = batch.download().await else {
            panic!("expected failure");
        };
        assert!(error.is_network());
        assert!(h.network.stream_offsets("https://host/two.bin").is_empty());
        assert_eq!(batch.status().bytes_downloaded, 100);
    }

    /// Rejects exactly the files of one size
    struct RejectSize(u64);

    impl StorageRequirementRule for RejectSize {
        fn has_violated_rule(&self, _: DiskSpace, bytes_to_write: u64) -> bool {
            bytes_to_write == self.0
        }

        fn describe(&self) -> String {
            format!("no room for {} bytes", self.0)
        }
    }

    #[tokio::test]
    async fn latest_file_error_becomes_batch_error() {
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(2));
        network.serve("https://host/one.bin", vec![1u8; 500]);
        network.serve("https://host/two.bin", vec![2u8; 200]);
        network.fail_after("https://host/one.bin", 300);
        let h = Harness::with_options(
            network,
            FileDownloadMode::Concurrent {
                max_concurrent_files: 2,
            },
            Vec::new(),
            vec![Arc::new(RejectSize(200))],
            ThrottleMode::Unthrottled,
        );
        let batch = h.factory.create(&two_file_batch());

        let BatchOutcome::Failed(error) = batch.download().await else {
            panic!("expected failure");
        };

        let files = batch.file_statuses();
        assert_eq!(
            files[1].error.as_ref().map(|e| e.kind),
            Some(DownloadErrorKind::InsufficientSpace)
        );
        assert_eq!(
            files[0].error.as_ref().map(|e| e.kind),
            Some(DownloadErrorKind::NetworkError)
        );
        assert_eq!(error.kind, DownloadErrorKind::NetworkError);
        assert_eq!(batch.status().error, Some(error));
        let stored = h.memory.load_batches().await.unwrap();
        assert_eq!(stored[0].error_kind.as_deref(), Some("network_error"));
    }

    #[tokio::test]
    async fn time_throttled_delete_emits_nothing_after_deleted() {
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(5));
        network.serve("https://host/one.bin", vec![1u8; 1000]);
        network.serve("https://host/two.bin", vec![2u8; 100]);
        let h = Harness::with_options(
            network,
            FileDownloadMode::Sequential,
            Vec::new(),
            Vec::new(),
            ThrottleMode::ByTime { period_ms: 10 },
        );
        let batch = Arc::new(h.factory.create(&two_file_batch()));

        let driver = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move { batch.download().await })
        };
        while batch.status().bytes_downloaded == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        batch.delete().await;
        assert_eq!(driver.await.unwrap(), BatchOutcome::Deleted);

        let at_delete = h.statuses();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let statuses = h.statuses();
        assert_eq!(statuses, at_delete, "no status after the batch was deleted");
        assert_eq!(statuses.last(), Some(&Status::Deleted));
        assert_eq!(statuses.iter().filter(|s| **s == Status::Deleted).count(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_continue_where_stopped() {
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(5));
        network.serve("https://host/one.bin", vec![1u8; 1000]);
        network.serve("https://host/two.bin", vec![2u8; 100]);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = Arc::new(h.factory.create(&two_file_batch()));

        let driver = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move { batch.download().await })
        };
        while batch.status().bytes_downloaded == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(batch.pause());
        assert_eq!(driver.await.unwrap(), BatchOutcome::Paused);
        let kept = batch.file_statuses()[0].file_size.current_bytes;
        assert!(kept > 0 && kept < 1000);

        assert!(batch.resume());
        assert_eq!(batch.download().await, BatchOutcome::Downloaded);
        assert_eq!(h.network.stream_offsets("https://host/one.bin")[1], kept);
    }

    #[tokio::test]
    async fn delete_while_running_emits_deleted_last() {
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(5));
        network.serve("https://host/one.bin", vec![1u8; 1000]);
        network.serve("https://host/two.bin", vec![2u8; 100]);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = Arc::new(h.factory.create(&two_file_batch()));

        let driver = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move { batch.download().await })
        };
        while batch.status().bytes_downloaded == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!batch.delete().await, "running batch finishes deletion itself");
        assert_eq!(driver.await.unwrap(), BatchOutcome::Deleted);

        let statuses = h.statuses();
        assert_eq!(statuses.last(), Some(&Status::Deleted));
        assert_eq!(statuses.iter().filter(|s| **s == Status::Deleted).count(), 1);
        assert!(!h.dir.path().join("b1").exists());
        assert!(h.memory.load_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_idle_batch_completes_immediately() {
        let network = FakeNetwork::new();
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());
        batch.checkpoint_now().await.unwrap();

        assert!(batch.delete().await);
        assert!(!batch.delete().await);
        assert_eq!(batch.status().status, Status::Deleted);
        assert_eq!(batch.download().await, BatchOutcome::Skipped);
        assert!(h.memory.load_batches().await.unwrap().is_empty());
        assert_eq!(h.statuses(), vec![Status::Deleting, Status::Deleted]);
    }

    #[tokio::test]
    async fn disallowed_network_parks_batch() {
        let network = FakeNetwork::new();
        network.serve("https://host/one.bin", vec![1u8; 10]);
        network.serve("https://host/two.bin", vec![2u8; 10]);
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        h.connection.set_network(NetworkType::None);
        let batch = h.factory.create(&two_file_batch());

        assert_eq!(batch.download().await, BatchOutcome::WaitingForNetwork);
        assert_eq!(batch.status().status, Status::WaitingForNetwork);

        h.connection.set_network(NetworkType::Unmetered);
        assert!(batch.resume());
        assert_eq!(batch.download().await, BatchOutcome::Downloaded);
    }

    #[tokio::test]
    async fn only_queued_batches_are_driven() {
        let network = FakeNetwork::new();
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());
        assert!(batch.pause());

        assert_eq!(batch.download().await, BatchOutcome::Skipped);
        assert_eq!(h.network.size_requests(), 0);
        assert!(!batch.pause(), "already paused");
    }

    #[tokio::test]
    async fn notification_flag_is_persisted() {
        let network = FakeNetwork::new();
        let h = Harness::new(network, FileDownloadMode::Sequential, Vec::new());
        let batch = h.factory.create(&two_file_batch());
        batch.checkpoint_now().await.unwrap();

        batch.mark_notification_seen();
        batch.checkpoint_now().await.unwrap();

        assert!(batch.status().notification_seen);
        assert!(h.memory.load_batches().await.unwrap()[0].notification_seen);
    }
}
