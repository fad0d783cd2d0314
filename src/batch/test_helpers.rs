//! In-process network fakes shared by batch and manager tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::checkpoint::Checkpointer;
use super::file::FileCollaborators;
use crate::db::MemoryPersistence;
use crate::network::{
    DownloadCallback, FileDownloader, FileDownloaderCreator, FileSizeRequester, SizeRequestError,
};
use crate::storage::{LocalFilePersistenceCreator, StorageRequirementRule};
use crate::types::FileSize;

const CHUNK_SIZE: usize = 100;

#[derive(Clone, Default)]
struct Served {
    body: Vec<u8>,
    report_size: bool,
    fail_after: Option<usize>,
}

/// Scriptable stand-in for remote servers
///
/// Serves registered bodies in fixed-size chunks, optionally with a delay
/// between chunks so tests can act while a stream is running.
#[derive(Default)]
pub(crate) struct FakeNetwork {
    served: Mutex<HashMap<String, Served>>,
    offsets: Mutex<HashMap<String, Vec<i64>>>,
    size_requests: AtomicUsize,
    offline: AtomicBool,
    chunk_delay: Option<Duration>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_chunk_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunk_delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.served.lock().unwrap().insert(
            url.to_string(),
            Served {
                body,
                report_size: true,
                fail_after: None,
            },
        );
    }

    pub fn serve_without_size(&self, url: &str, body: Vec<u8>) {
        self.served.lock().unwrap().insert(
            url.to_string(),
            Served {
                body,
                report_size: false,
                fail_after: None,
            },
        );
    }

    /// Cut every stream of `url` after `bytes` bytes of the body
    pub fn fail_after(&self, url: &str, bytes: usize) {
        if let Some(served) = self.served.lock().unwrap().get_mut(url) {
            served.fail_after = Some(bytes);
        }
    }

    /// Stop cutting streams of `url`
    pub fn heal(&self, url: &str) {
        if let Some(served) = self.served.lock().unwrap().get_mut(url) {
            served.fail_after = None;
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Start offsets of every stream opened for `url`, in order
    pub fn stream_offsets(&self, url: &str) -> Vec<i64> {
        self.offsets
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn size_requests(&self) -> usize {
        self.size_requests.load(Ordering::SeqCst)
    }

    pub fn downloader_creator(self: &Arc<Self>) -> Arc<dyn FileDownloaderCreator> {
        Arc::new(FakeDownloaderCreator(Arc::clone(self)))
    }

    fn lookup(&self, url: &str) -> Option<Served> {
        self.served.lock().unwrap().get(url).cloned()
    }
}

#[async_trait]
impl FileSizeRequester for FakeNetwork {
    async fn request_file_size(&self, url: &str) -> Result<FileSize, SizeRequestError> {
        self.size_requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(SizeRequestError::RequestFailed("network unreachable".to_string()));
        }
        match self.lookup(url) {
            Some(served) if served.report_size => Ok(FileSize::new(0, served.body.len() as i64)),
            Some(_) => Err(SizeRequestError::NoUsableLength),
            None => Err(SizeRequestError::Status(404)),
        }
    }
}

struct FakeDownloaderCreator(Arc<FakeNetwork>);

impl FileDownloaderCreator for FakeDownloaderCreator {
    fn create(&self) -> Arc<dyn FileDownloader> {
        Arc::new(FakeDownloader {
            network: Arc::clone(&self.0),
            stop: AtomicBool::new(false),
        })
    }
}

struct FakeDownloader {
    network: Arc<FakeNetwork>,
    stop: AtomicBool,
}

#[async_trait]
impl FileDownloader for FakeDownloader {
    async fn start_downloading(
        &self,
        url: &str,
        file_size: FileSize,
        callback: &mut dyn DownloadCallback,
    ) {
        self.stop.store(false, Ordering::SeqCst);
        self.network
            .offsets
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push(file_size.current_bytes);

        let served = match self.network.lookup(url) {
            Some(served) if !self.network.offline.load(Ordering::SeqCst) => served,
            Some(_) => {
                callback.on_error("network unreachable");
                callback.on_download_finished();
                return;
            }
            None => {
                callback.on_error("HTTP 404");
                callback.on_download_finished();
                return;
            }
        };

        let start = (file_size.current_bytes.max(0) as usize).min(served.body.len());
        let end = served.fail_after.unwrap_or(served.body.len()).max(start);
        for chunk in served.body[start..end.min(served.body.len())].chunks(CHUNK_SIZE) {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if let Some(delay) = self.network.chunk_delay {
                tokio::time::sleep(delay).await;
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            callback.on_bytes_read(chunk);
            tokio::task::yield_now().await;
        }
        if served.fail_after.is_some() && !self.stop.load(Ordering::SeqCst) {
            callback.on_error("connection reset");
        }
        callback.on_download_finished();
    }

    fn stop_downloading(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn collaborators(
    network: &Arc<FakeNetwork>,
    rules: Vec<Arc<dyn StorageRequirementRule>>,
) -> FileCollaborators {
    FileCollaborators {
        size_requester: Arc::clone(network) as Arc<dyn FileSizeRequester>,
        downloader_creator: network.downloader_creator(),
        persistence_creator: Arc::new(LocalFilePersistenceCreator::new(rules)),
    }
}

pub(crate) fn checkpointer() -> Checkpointer {
    Checkpointer::new(Arc::new(MemoryPersistence::new()))
}
