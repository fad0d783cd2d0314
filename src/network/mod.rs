//! Network collaborators: byte streaming and remote size discovery.
//!
//! - [`downloader`] - [`FileDownloader`] contract and the reqwest-backed [`HttpFileDownloader`]
//! - [`size`] - [`FileSizeRequester`] contract with HEAD, GET and composite probes

pub mod downloader;
pub mod size;

pub use downloader::{
    DownloadCallback, FileDownloader, FileDownloaderCreator, HttpFileDownloader,
    HttpFileDownloaderCreator,
};
pub use size::{
    CompositeSizeRequester, FileSizeRequester, GetSizeRequester, HeadSizeRequester,
    SizeRequestError,
};

use std::time::Duration;

use crate::error::Result;

/// Build the HTTP client shared by the default network collaborators
///
/// Only the connect phase is bounded by `connect_timeout`; streaming a large
/// body may legitimately take much longer.
pub fn http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("batch-dl/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}
