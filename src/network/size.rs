//! Remote file size discovery.
//!
//! The composite probe asks with `HEAD` first. When that fails or reports no
//! usable length it falls back to `GET` and reads only the response headers;
//! the body is dropped unread. A length of zero is never reported as a size:
//! an unusable length is an error, not an empty file.

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap};
use std::time::Duration;

use crate::types::FileSize;

/// Why a size probe produced no usable size
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizeRequestError {
    /// The request could not be sent or timed out
    #[error("size request failed: {0}")]
    RequestFailed(String),

    /// The server answered with a non-success status
    #[error("size request rejected with status {0}")]
    Status(u16),

    /// The response carried no positive length
    #[error("response carried no usable content length")]
    NoUsableLength,
}

/// Determines the total size of a remote file
#[async_trait]
pub trait FileSizeRequester: Send + Sync {
    /// A [`FileSize`] with `current_bytes == 0` and a known `total_bytes`
    async fn request_file_size(&self, url: &str) -> Result<FileSize, SizeRequestError>;
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

/// Positive length advertised by `Content-Length`, or the total of a `Content-Range`
fn usable_length(headers: &HeaderMap) -> Option<i64> {
    let from_length = header_str(headers, CONTENT_LENGTH)
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|len| *len > 0);
    if from_length.is_some() {
        return from_length;
    }

    // "bytes 0-99/1234"
    header_str(headers, CONTENT_RANGE)
        .and_then(|value| value.rsplit('/').next().map(str::to_string))
        .and_then(|total| total.parse::<i64>().ok())
        .filter(|len| *len > 0)
}

/// `HEAD`-only probe
pub struct HeadSizeRequester {
    client: reqwest::Client,
    timeout: Duration,
}

impl HeadSizeRequester {
    /// Create a HEAD probe bounded by `timeout`
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FileSizeRequester for HeadSizeRequester {
    async fn request_file_size(&self, url: &str) -> Result<FileSize, SizeRequestError> {
        let response = self
            .client
            .head(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SizeRequestError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SizeRequestError::Status(response.status().as_u16()));
        }

        // reqwest's content_length() is the body hint, which is 0 for HEAD; read the header.
        usable_length(response.headers())
            .map(|total| FileSize::new(0, total))
            .ok_or(SizeRequestError::NoUsableLength)
    }
}

/// `GET` probe reading only the headers
pub struct GetSizeRequester {
    client: reqwest::Client,
    timeout: Duration,
}

impl GetSizeRequester {
    /// Create a GET probe bounded by `timeout`
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FileSizeRequester for GetSizeRequester {
    async fn request_file_size(&self, url: &str) -> Result<FileSize, SizeRequestError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SizeRequestError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SizeRequestError::Status(response.status().as_u16()));
        }

        let length = usable_length(response.headers());
        // Dropping the response closes the stream without reading the body.
        drop(response);

        length
            .map(|total| FileSize::new(0, total))
            .ok_or(SizeRequestError::NoUsableLength)
    }
}

/// `HEAD` probe with `GET` fallback
pub struct CompositeSizeRequester {
    head: Box<dyn FileSizeRequester>,
    get: Box<dyn FileSizeRequester>,
}

impl CompositeSizeRequester {
    /// Compose two probes; `get` is only asked when `head` fails
    pub fn new(head: Box<dyn FileSizeRequester>, get: Box<dyn FileSizeRequester>) -> Self {
        Self { head, get }
    }

    /// The HTTP probes sharing `client`
    pub fn http(client: reqwest::Client, timeout: Duration) -> Self {
        Self::new(
            Box::new(HeadSizeRequester::new(client.clone(), timeout)),
            Box::new(GetSizeRequester::new(client, timeout)),
        )
    }
}

#[async_trait]
impl FileSizeRequester for CompositeSizeRequester {
    async fn request_file_size(&self, url: &str) -> Result<FileSize, SizeRequestError> {
        match self.head.request_file_size(url).await {
            Ok(size) => Ok(size),
            Err(head_error) => {
                tracing::debug!(url, error = %head_error, "HEAD probe inconclusive, falling back to GET");
                self.get.request_file_size(url).await
            }
        }
    }
}
