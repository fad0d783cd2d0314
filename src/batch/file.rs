//! State machine of a single file within a batch.
//!
//! A [`DownloadFile`] owns one [`FileDownloader`] and one [`FilePersistence`].
//! [`DownloadFile::download`] discovers the total size, opens the local sink,
//! reconciles with bytes already on disk and streams the rest. Control calls
//! (`pause`, `delete`, ...) can arrive from any task while a stream is running;
//! they flip the status and ask the downloader to stop, and the stream winds
//! down through [`DownloadCallback::on_download_finished`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::checkpoint::{Checkpoint, Checkpointer};
use crate::db::FileRecord;
use crate::network::{DownloadCallback, FileDownloader, FileDownloaderCreator, FileSizeRequester};
use crate::storage::{FilePersistence, FilePersistenceCreator, FilePersistenceResult};
use crate::types::{
    BatchId, DownloadError, DownloadErrorKind, DownloadFileStatus, FileId, FilePath, FileSize,
    FileStatus,
};

/// Receives every snapshot a file produces while it is driven
pub type FileProgress<'a> = &'a (dyn Fn(&DownloadFileStatus) + Send + Sync);

/// Network and storage collaborators shared by every file
#[derive(Clone)]
pub struct FileCollaborators {
    /// Remote size discovery
    pub size_requester: Arc<dyn FileSizeRequester>,
    /// One downloader per file
    pub downloader_creator: Arc<dyn FileDownloaderCreator>,
    /// One local sink per file
    pub persistence_creator: Arc<dyn FilePersistenceCreator>,
}

/// Initial state of a file, fresh or restored from a checkpoint
#[derive(Debug, Clone)]
pub(crate) struct FileEntry {
    pub file_id: FileId,
    pub url: String,
    pub target: PathBuf,
    pub position: usize,
    pub status: FileStatus,
    pub file_size: FileSize,
    pub path: FilePath,
}

impl FileEntry {
    /// A file that has never been driven
    pub fn queued(
        file_id: FileId,
        url: String,
        target: PathBuf,
        position: usize,
        declared_size: Option<i64>,
    ) -> Self {
        Self {
            file_id,
            url,
            target,
            position,
            status: FileStatus::Queued,
            file_size: FileSize::new(0, declared_size.unwrap_or(0)),
            path: FilePath::Unknown,
        }
    }
}

struct FileState {
    status: FileStatus,
    file_size: FileSize,
    path: FilePath,
    error: Option<DownloadError>,
    // A stream is open; its finish handler owns closing or deleting the sink
    streaming: bool,
}

/// One file of a batch
pub struct DownloadFile {
    batch_id: BatchId,
    file_id: FileId,
    url: String,
    target: PathBuf,
    position: usize,
    size_requester: Arc<dyn FileSizeRequester>,
    downloader: Arc<dyn FileDownloader>,
    sink: Mutex<Box<dyn FilePersistence>>,
    checkpointer: Checkpointer,
    state: Mutex<FileState>,
}

impl DownloadFile {
    pub(crate) fn new(
        batch_id: BatchId,
        entry: FileEntry,
        collaborators: &FileCollaborators,
        checkpointer: Checkpointer,
    ) -> Self {
        Self {
            batch_id,
            file_id: entry.file_id,
            url: entry.url,
            target: entry.target,
            position: entry.position,
            size_requester: Arc::clone(&collaborators.size_requester),
            downloader: collaborators.downloader_creator.create(),
            sink: Mutex::new(collaborators.persistence_creator.create()),
            checkpointer,
            state: Mutex::new(FileState {
                status: entry.status,
                file_size: entry.file_size,
                path: entry.path,
                error: None,
                streaming: false,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sink(&self) -> MutexGuard<'_, Box<dyn FilePersistence>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// File identifier
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Current byte counters
    pub fn file_size(&self) -> FileSize {
        self.lock_state().file_size
    }

    /// Current snapshot
    pub fn status(&self) -> DownloadFileStatus {
        let state = self.lock_state();
        self.snapshot(&state)
    }

    fn snapshot(&self, state: &FileState) -> DownloadFileStatus {
        DownloadFileStatus {
            batch_id: self.batch_id.clone(),
            file_id: self.file_id.clone(),
            status: state.status,
            file_size: state.file_size,
            path: state.path.clone(),
            error: state.error.clone(),
        }
    }

    /// Persisted form of the current state
    pub(crate) fn record(&self) -> FileRecord {
        let state = self.lock_state();
        FileRecord {
            batch_id: self.batch_id.as_str().to_string(),
            file_id: self.file_id.as_str().to_string(),
            url: self.url.clone(),
            path: self.target.to_string_lossy().into_owned(),
            current_bytes: state.file_size.current_bytes,
            total_bytes: state.file_size.total_bytes,
            status: state.status.as_str().to_string(),
            position: self.position as i64,
        }
    }

    fn checkpoint(&self) {
        self.checkpointer.submit(Checkpoint::File(self.record()));
    }

    /// Total size, asking the network once if it is not known yet
    ///
    /// Returns 0 when the size cannot be determined.
    pub async fn ensure_total_size(&self) -> i64 {
        let known = self.file_size();
        if known.is_total_known() {
            return known.total_bytes;
        }
        match self.size_requester.request_file_size(&self.url).await {
            Ok(size) if size.is_total_known() => {
                self.lock_state().file_size.set_total(size.total_bytes);
                size.total_bytes
            }
            Ok(_) => 0,
            Err(e) => {
                tracing::debug!(
                    batch_id = %self.batch_id,
                    file_id = %self.file_id,
                    error = %e,
                    "Total size unavailable"
                );
                0
            }
        }
    }

    /// Drive the file until it is downloaded, fails or is stopped
    ///
    /// Does nothing unless the file is queued (or already downloading, when
    /// a previous run was cut short). Every snapshot goes to `progress`.
    pub async fn download(&self, progress: FileProgress<'_>) {
        progress(&self.status());

        {
            let mut state = self.lock_state();
            match state.status {
                FileStatus::Queued => {
                    state.status = FileStatus::Downloading;
                    state.error = None;
                }
                FileStatus::Downloading => {}
                _ => return,
            }
        }

        if !self.file_size().is_total_known() {
            match self.size_requester.request_file_size(&self.url).await {
                Ok(size) if size.is_total_known() => {
                    self.lock_state().file_size.set_total(size.total_bytes)
                }
                Ok(_) => {
                    self.fail(
                        DownloadError::new(
                            DownloadErrorKind::SizeRequestFailed,
                            "server did not report a size",
                        ),
                        progress,
                    );
                    return;
                }
                Err(e) => {
                    self.fail(
                        DownloadError::new(DownloadErrorKind::SizeRequestFailed, e.to_string()),
                        progress,
                    );
                    return;
                }
            }
        }

        let created = self.lock_sink().create(&self.target, self.file_size());
        if let Some(error) = creation_error(created) {
            self.fail(error, progress);
            return;
        }

        let on_disk = self.lock_sink().current_size(&self.target);
        let start_size = {
            let mut state = self.lock_state();
            state.path = FilePath::Known(self.target.clone());
            if on_disk > state.file_size.total_bytes {
                None
            } else {
                state.file_size.set_current(on_disk);
                Some(state.file_size)
            }
        };
        let Some(start_size) = start_size else {
            self.lock_sink().close();
            self.fail(
                DownloadError::new(
                    DownloadErrorKind::SizeMismatch,
                    format!("{on_disk} bytes on disk exceed the remote size"),
                ),
                progress,
            );
            return;
        };

        if start_size.is_complete() {
            self.lock_sink().close();
            self.complete(progress);
            return;
        }

        let claimed = {
            let mut state = self.lock_state();
            if state.status == FileStatus::Downloading {
                state.streaming = true;
                Some(self.snapshot(&state))
            } else {
                None
            }
        };
        let Some(snapshot) = claimed else {
            self.abandon();
            return;
        };
        progress(&snapshot);

        tracing::debug!(
            batch_id = %self.batch_id,
            file_id = %self.file_id,
            offset = start_size.current_bytes,
            total = start_size.total_bytes,
            "Streaming file"
        );

        let mut sink = StreamSink {
            file: self,
            progress,
        };
        self.downloader
            .start_downloading(&self.url, start_size, &mut sink)
            .await;

        // No-op when the downloader already reported the end of the stream
        self.finish_stream(progress);
    }

    // Sink was opened but the file was stopped before streaming started
    fn abandon(&self) {
        let status = self.lock_state().status;
        let mut sink = self.lock_sink();
        if status == FileStatus::Deletion {
            sink.delete(&self.target);
        } else {
            sink.close();
        }
    }

    fn complete(&self, progress: FileProgress<'_>) {
        let snapshot = {
            let mut state = self.lock_state();
            if state.status != FileStatus::Downloading {
                return;
            }
            state.status = FileStatus::Downloaded;
            state.error = None;
            self.snapshot(&state)
        };
        tracing::debug!(batch_id = %self.batch_id, file_id = %self.file_id, "File downloaded");
        self.checkpoint();
        progress(&snapshot);
    }

    fn fail(&self, error: DownloadError, progress: FileProgress<'_>) {
        let snapshot = {
            let mut state = self.lock_state();
            if !matches!(state.status, FileStatus::Queued | FileStatus::Downloading) {
                return;
            }
            state.status = FileStatus::Error;
            state.error = Some(error.clone());
            self.snapshot(&state)
        };
        tracing::warn!(
            batch_id = %self.batch_id,
            file_id = %self.file_id,
            error = %error,
            "File download failed"
        );
        self.checkpoint();
        progress(&snapshot);
    }

    fn finish_stream(&self, progress: FileProgress<'_>) {
        let (status, file_size) = {
            let mut state = self.lock_state();
            if !state.streaming {
                return;
            }
            state.streaming = false;
            (state.status, state.file_size)
        };

        match status {
            FileStatus::Deletion => self.lock_sink().delete(&self.target),
            FileStatus::Downloading => {
                self.lock_sink().close();
                if file_size.is_complete() {
                    self.complete(progress);
                } else {
                    self.fail(
                        DownloadError::new(
                            DownloadErrorKind::NetworkError,
                            format!(
                                "stream ended after {} of {} bytes",
                                file_size.current_bytes, file_size.total_bytes
                            ),
                        ),
                        progress,
                    );
                }
            }
            _ => {
                self.lock_sink().close();
                self.checkpoint();
            }
        }
    }

    fn write_chunk(&self, buffer: &[u8], progress: FileProgress<'_>) {
        let position = {
            let state = self.lock_state();
            if state.status != FileStatus::Downloading {
                None
            } else {
                Some(state.file_size)
            }
        };
        let Some(file_size) = position else {
            self.downloader.stop_downloading();
            return;
        };
        let offset = file_size.current_bytes;

        // A file never holds more than its known total
        if file_size.is_total_known() && offset + buffer.len() as i64 > file_size.total_bytes {
            self.fail(
                DownloadError::new(
                    DownloadErrorKind::SizeMismatch,
                    format!(
                        "stream exceeds expected size of {} bytes",
                        file_size.total_bytes
                    ),
                ),
                progress,
            );
            self.downloader.stop_downloading();
            return;
        }

        if !self.lock_sink().write(buffer, offset as u64) {
            self.fail(
                DownloadError::new(
                    DownloadErrorKind::WriteFailed,
                    format!("cannot write to {}", self.target.display()),
                ),
                progress,
            );
            self.downloader.stop_downloading();
            return;
        }

        // Only a downloading file reports progress; a stopped file re-reports
        // its size on the next `download`
        let snapshot = {
            let mut state = self.lock_state();
            state.file_size.add_current(buffer.len() as i64);
            (state.status == FileStatus::Downloading).then(|| self.snapshot(&state))
        };
        if let Some(snapshot) = snapshot {
            progress(&snapshot);
        }
    }

    /// Stop the file and keep its bytes
    pub fn pause(&self) {
        let changed = {
            let mut state = self.lock_state();
            if state.status.can_transition_to(FileStatus::Paused) {
                state.status = FileStatus::Paused;
                !state.streaming
            } else {
                false
            }
        };
        self.downloader.stop_downloading();
        if changed {
            self.checkpoint();
        }
    }

    /// Queue a paused, failed or waiting file again
    pub fn resume(&self) {
        let changed = {
            let mut state = self.lock_state();
            let resumable = matches!(
                state.status,
                FileStatus::Paused | FileStatus::Error | FileStatus::WaitingForNetwork
            );
            if resumable {
                state.status = FileStatus::Queued;
                state.error = None;
            }
            resumable
        };
        if changed {
            self.checkpoint();
        }
    }

    /// Hold the file until a permitted network is back
    pub fn wait_for_network(&self) {
        let changed = {
            let mut state = self.lock_state();
            if matches!(state.status, FileStatus::Queued | FileStatus::Downloading) {
                state.status = FileStatus::WaitingForNetwork;
                !state.streaming
            } else {
                false
            }
        };
        self.downloader.stop_downloading();
        if changed {
            self.checkpoint();
        }
    }

    /// Mark the file for deletion and remove its bytes
    ///
    /// A running stream is stopped first; its finish handler removes the bytes.
    pub fn delete(&self) {
        let streaming = {
            let mut state = self.lock_state();
            state.status = FileStatus::Deletion;
            state.streaming
        };
        if streaming {
            self.downloader.stop_downloading();
        } else {
            self.lock_sink().delete(&self.target);
        }
    }
}

fn creation_error(result: FilePersistenceResult) -> Option<DownloadError> {
    let (kind, message) = match result {
        FilePersistenceResult::Success => return None,
        FilePersistenceResult::ErrorUnknownTotalFileSize => (
            DownloadErrorKind::SizeRequestFailed,
            "total size unknown".to_string(),
        ),
        FilePersistenceResult::ErrorInsufficientSpace(message) => {
            (DownloadErrorKind::InsufficientSpace, message)
        }
        FilePersistenceResult::ErrorStorageUnwritable(message) => {
            (DownloadErrorKind::StorageUnwritable, message)
        }
        FilePersistenceResult::ErrorOpeningFile(message) => (DownloadErrorKind::WriteFailed, message),
    };
    Some(DownloadError::new(kind, message))
}

struct StreamSink<'a> {
    file: &'a DownloadFile,
    progress: FileProgress<'a>,
}

impl DownloadCallback for StreamSink<'_> {
    fn on_bytes_read(&mut self, buffer: &[u8]) {
        self.file.write_chunk(buffer, self.progress);
    }

    fn on_error(&mut self, cause: &str) {
        self.file.fail(
            DownloadError::new(DownloadErrorKind::NetworkError, cause),
            self.progress,
        );
    }

    fn on_download_finished(&mut self) {
        self.file.finish_stream(self.progress);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_helpers::{FakeNetwork, checkpointer, collaborators};
    use crate::storage::StorageRequirementRule;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<DownloadFileStatus>>);

    impl Recorder {
        fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }

        fn statuses(&self) -> Vec<FileStatus> {
            self.0.lock().unwrap().iter().map(|s| s.status).collect()
        }

        fn last(&self) -> DownloadFileStatus {
            self.0.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn file(
        dir: &TempDir,
        network: &Arc<FakeNetwork>,
        url: &str,
        rules: Vec<Arc<dyn StorageRequirementRule>>,
    ) -> DownloadFile {
        let batch_id = BatchId::new("batch").unwrap();
        let entry = FileEntry::queued(
            FileId::derived(&batch_id, url),
            url.to_string(),
            dir.path().join("batch").join("file.bin"),
            0,
            None,
        );
        DownloadFile::new(batch_id, entry, &collaborators(network, rules), checkpointer())
    }

    #[tokio::test]
    async fn downloads_whole_file_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![7u8; 100]);
        let file = file(&dir, &network, "https://host/a", Vec::new());
        let recorder = Recorder::new();

        file.download(&|s: &DownloadFileStatus| recorder.0.lock().unwrap().push(s.clone()))
            .await;

        let last = recorder.last();
        assert_eq!(last.status, FileStatus::Downloaded);
        assert_eq!(last.file_size, FileSize::new(100, 100));
        assert_eq!(
            std::fs::read(dir.path().join("batch/file.bin")).unwrap(),
            vec![7u8; 100]
        );
        assert_eq!(recorder.statuses()[0], FileStatus::Queued);
    }

    #[tokio::test]
    async fn resumes_from_bytes_already_on_disk() {
        let dir = TempDir::new().unwrap();
        let body: Vec<u8> = (0..200u8).collect();
        let network = FakeNetwork::new();
        network.serve("https://host/a", body.clone());
        std::fs::create_dir_all(dir.path().join("batch")).unwrap();
        std::fs::write(dir.path().join("batch/file.bin"), &body[..80]).unwrap();
        let file = file(&dir, &network, "https://host/a", Vec::new());

        file.download(&|_: &DownloadFileStatus| {}).await;

        assert_eq!(file.status().status, FileStatus::Downloaded);
        assert_eq!(network.stream_offsets("https://host/a"), vec![80]);
        assert_eq!(std::fs::read(dir.path().join("batch/file.bin")).unwrap(), body);
    }

    #[tokio::test]
    async fn complete_file_on_disk_is_not_streamed() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![1u8; 10]);
        std::fs::create_dir_all(dir.path().join("batch")).unwrap();
        std::fs::write(dir.path().join("batch/file.bin"), vec![1u8; 10]).unwrap();
        let file = file(&dir, &network, "https://host/a", Vec::new());

        file.download(&|_: &DownloadFileStatus| {}).await;

        assert_eq!(file.status().status, FileStatus::Downloaded);
        assert!(network.stream_offsets("https://host/a").is_empty());
    }

    #[tokio::test]
    async fn larger_file_on_disk_is_a_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![1u8; 10]);
        std::fs::create_dir_all(dir.path().join("batch")).unwrap();
        std::fs::write(dir.path().join("batch/file.bin"), vec![1u8; 20]).unwrap();
        let file = file(&dir, &network, "https://host/a", Vec::new());

        file.download(&|_: &DownloadFileStatus| {}).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Error);
        assert_eq!(status.error.unwrap().kind, DownloadErrorKind::SizeMismatch);
    }

    #[tokio::test]
    async fn stream_longer_than_declared_size_is_a_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![3u8; 100]);
        let batch_id = BatchId::new("batch").unwrap();
        let entry = FileEntry::queued(
            FileId::derived(&batch_id, "https://host/a"),
            "https://host/a".to_string(),
            dir.path().join("batch").join("file.bin"),
            0,
            Some(50),
        );
        let file = DownloadFile::new(
            batch_id,
            entry,
            &collaborators(&network, Vec::new()),
            checkpointer(),
        );

        file.download(&|_: &DownloadFileStatus| {}).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Error);
        assert_eq!(status.error.unwrap().kind, DownloadErrorKind::SizeMismatch);
        assert!(status.file_size.current_bytes <= 50);
        let on_disk = status
            .path
            .as_path()
            .and_then(|path| std::fs::metadata(path).ok())
            .map_or(0, |m| m.len());
        assert!(on_disk <= 50, "{on_disk} bytes on disk");
    }

    #[tokio::test]
    async fn unknown_size_fails_with_size_request_error() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve_without_size("https://host/a", vec![1u8; 10]);
        let file = file(&dir, &network, "https://host/a", Vec::new());

        assert_eq!(file.ensure_total_size().await, 0);
        file.download(&|_: &DownloadFileStatus| {}).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Error);
        assert_eq!(status.error.unwrap().kind, DownloadErrorKind::SizeRequestFailed);
        assert!(status.path.is_unknown());
    }

    #[tokio::test]
    async fn storage_rule_blocks_file_with_insufficient_space() {
        struct NeverEnough;
        impl StorageRequirementRule for NeverEnough {
            fn has_violated_rule(&self, _: crate::utils::DiskSpace, _: u64) -> bool {
                true
            }
            fn describe(&self) -> String {
                "never enough".to_string()
            }
        }

        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![1u8; 10]);
        let file = file(&dir, &network, "https://host/a", vec![Arc::new(NeverEnough)]);

        file.download(&|_: &DownloadFileStatus| {}).await;

        let error = file.status().error.unwrap();
        assert_eq!(error.kind, DownloadErrorKind::InsufficientSpace);
        assert_eq!(error.message, "never enough");
    }

    #[tokio::test]
    async fn interrupted_stream_is_a_network_error() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![1u8; 100]);
        network.fail_after("https://host/a", 40);
        let file = file(&dir, &network, "https://host/a", Vec::new());

        file.download(&|_: &DownloadFileStatus| {}).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Error);
        assert!(status.error.unwrap().is_network());
        assert_eq!(status.file_size.current_bytes, 40);
    }

    #[tokio::test]
    async fn pause_stops_stream_and_keeps_bytes() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(5));
        network.serve("https://host/a", vec![1u8; 1000]);
        let file = Arc::new(file(&dir, &network, "https://host/a", Vec::new()));

        let driver = {
            let file = Arc::clone(&file);
            tokio::spawn(async move { file.download(&|_: &DownloadFileStatus| {}).await })
        };
        while file.file_size().current_bytes == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        file.pause();
        driver.await.unwrap();

        let status = file.status();
        assert_eq!(status.status, FileStatus::Paused);
        let kept = status.file_size.current_bytes;
        assert!(kept > 0 && kept < 1000);
        let on_disk = std::fs::metadata(dir.path().join("batch/file.bin")).unwrap().len();
        assert_eq!(on_disk as i64, kept);

        file.resume();
        file.download(&|_: &DownloadFileStatus| {}).await;
        assert_eq!(file.status().status, FileStatus::Downloaded);
        assert_eq!(network.stream_offsets("https://host/a")[1], kept);
    }

    #[tokio::test]
    async fn delete_while_streaming_removes_bytes() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::with_chunk_delay(Duration::from_millis(5));
        network.serve("https://host/a", vec![1u8; 1000]);
        let file = Arc::new(file(&dir, &network, "https://host/a", Vec::new()));

        let driver = {
            let file = Arc::clone(&file);
            tokio::spawn(async move { file.download(&|_: &DownloadFileStatus| {}).await })
        };
        while file.file_size().current_bytes == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        file.delete();
        driver.await.unwrap();

        assert_eq!(file.status().status, FileStatus::Deletion);
        assert!(!dir.path().join("batch/file.bin").exists());
    }

    #[tokio::test]
    async fn non_queued_file_is_not_driven() {
        let dir = TempDir::new().unwrap();
        let network = FakeNetwork::new();
        network.serve("https://host/a", vec![1u8; 10]);
        let file = file(&dir, &network, "https://host/a", Vec::new());
        file.pause();

        file.download(&|_: &DownloadFileStatus| {}).await;

        assert_eq!(file.status().status, FileStatus::Paused);
        assert_eq!(network.size_requests(), 0);
    }
}
