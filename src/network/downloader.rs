//! Streaming of remote bytes into a [`DownloadCallback`].

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::FileSize;

/// Receiver of a byte stream
///
/// A downloader calls `on_bytes_read` for every chunk, `on_error` at most once
/// when the transfer fails, and `on_download_finished` exactly once when it
/// stops for any reason (success, error or stop request).
pub trait DownloadCallback: Send {
    /// A chunk of the remote file, in order
    fn on_bytes_read(&mut self, buffer: &[u8]);

    /// The transfer failed
    fn on_error(&mut self, cause: &str);

    /// The transfer is over; no further calls follow
    fn on_download_finished(&mut self);
}

/// Streams a remote file into a callback
///
/// One instance serves one file at a time. `stop_downloading` is advisory: the
/// stream is abandoned after the chunk currently being delivered.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    /// Stream `url` starting at `file_size.current_bytes`
    async fn start_downloading(
        &self,
        url: &str,
        file_size: FileSize,
        callback: &mut dyn DownloadCallback,
    );

    /// Request the running stream to stop
    fn stop_downloading(&self);
}

/// Creates one [`FileDownloader`] per file so stop requests never cross files
pub trait FileDownloaderCreator: Send + Sync {
    /// A fresh downloader
    fn create(&self) -> Arc<dyn FileDownloader>;
}

/// [`FileDownloader`] over HTTP(S) with `Range` resume
pub struct HttpFileDownloader {
    client: reqwest::Client,
    stop_requested: AtomicBool,
}

impl HttpFileDownloader {
    /// Create a downloader using `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            stop_requested: AtomicBool::new(false),
        }
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileDownloader for HttpFileDownloader {
    async fn start_downloading(
        &self,
        url: &str,
        file_size: FileSize,
        callback: &mut dyn DownloadCallback,
    ) {
        self.stop_requested.store(false, Ordering::SeqCst);
        let start_byte = file_size.current_bytes.max(0) as u64;

        let mut request = self.client.get(url);
        if start_byte > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={start_byte}-"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url, error = %e, "Request failed");
                callback.on_error(&e.to_string());
                callback.on_download_finished();
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url, status = status.as_u16(), "Server rejected download");
            callback.on_error(&format!("server responded with status {status}"));
            callback.on_download_finished();
            return;
        }

        // A server ignoring the range sends the whole body; drop what we already have.
        let mut skip = if start_byte > 0 && status != StatusCode::PARTIAL_CONTENT {
            tracing::debug!(url, start_byte, "Range ignored by server, skipping prefix");
            start_byte
        } else {
            0
        };

        let mut stream = response.bytes_stream();
        while !self.is_stop_requested() {
            let Some(chunk) = stream.next().await else {
                break;
            };
            match chunk {
                Ok(bytes) => {
                    let mut chunk: &[u8] = &bytes;
                    if skip > 0 {
                        let dropped = skip.min(chunk.len() as u64);
                        chunk = &chunk[dropped as usize..];
                        skip -= dropped;
                    }
                    if !chunk.is_empty() {
                        callback.on_bytes_read(chunk);
                    }
                }
                Err(e) => {
                    tracing::debug!(url, error = %e, "Stream interrupted");
                    callback.on_error(&e.to_string());
                    break;
                }
            }
        }

        callback.on_download_finished();
    }

    fn stop_downloading(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }
}

/// Creates [`HttpFileDownloader`]s sharing one connection pool
#[derive(Clone)]
pub struct HttpFileDownloaderCreator {
    client: reqwest::Client,
}

impl HttpFileDownloaderCreator {
    /// Create a factory around `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl FileDownloaderCreator for HttpFileDownloaderCreator {
    fn create(&self) -> Arc<dyn FileDownloader> {
        Arc::new(HttpFileDownloader::new(self.client.clone()))
    }
}
