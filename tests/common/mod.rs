//! Common test utilities for batch-dl integration tests

#![allow(dead_code)]

use batch_dl::config::ThrottleMode;
use batch_dl::{BatchId, Config, DownloadBatchStatus, Status};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Configuration rooted in `temp_dir` with a SQLite database and fast recovery
pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().join("downloads");
    config.persistence.database_path = temp_dir.path().join("batch-dl.db");
    config.throttle.mode = ThrottleMode::Unthrottled;
    config.recovery.initial_delay = Duration::from_millis(20);
    config.recovery.jitter = false;
    config
}

/// Serve `body` at `file_path` for both size probes and downloads
pub async fn serve_file(server: &MockServer, file_path: &str, body: Vec<u8>) {
    Mock::given(method("HEAD"))
        .and(path(file_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Number of GET requests the server received for `file_path`
pub async fn get_requests(server: &MockServer, file_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == file_path)
        .count()
}

/// Wait for `id` to report `status`, failing after ten seconds
pub async fn wait_for_status(
    updates: &mut broadcast::Receiver<DownloadBatchStatus>,
    id: &BatchId,
    status: Status,
) -> DownloadBatchStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match updates.recv().await {
                Ok(update) if &update.batch_id == id && update.status == status => return update,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("status channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {id} to become {status}"))
}
