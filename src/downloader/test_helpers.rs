//! Shared test helpers for creating DownloadManager instances in tests.

use crate::batch::test_helpers::{FakeNetwork, collaborators};
use crate::config::{Config, ThrottleMode};
use crate::connection::ConnectionChecker;
use crate::db::MemoryPersistence;
use crate::downloader::DownloadManager;
use crate::types::{BatchId, ConnectionType, DownloadBatchStatus, NetworkType, Status};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::broadcast;

/// A manager wired to in-process fakes
pub(crate) struct TestManager {
    pub manager: DownloadManager,
    pub network: Arc<FakeNetwork>,
    pub memory: Arc<MemoryPersistence>,
    pub connection: Arc<ConnectionChecker>,
    pub config: Config,
    pub temp_dir: TempDir,
}

/// Configuration for tests: unthrottled callbacks, fast recovery without jitter
pub(crate) fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().join("downloads");
    config.persistence.database_path = temp_dir.path().join("test.db");
    config.throttle.mode = ThrottleMode::Unthrottled;
    config.recovery.initial_delay = Duration::from_millis(20);
    config.recovery.max_delay = Duration::from_millis(100);
    config.recovery.jitter = false;
    config
}

/// Helper to create a started manager on an unmetered network.
/// The tempdir holding the download directory lives in the returned struct.
pub(crate) async fn create_test_manager(network: Arc<FakeNetwork>) -> TestManager {
    let temp_dir = tempdir().unwrap();
    let config = test_config(&temp_dir);
    let memory = Arc::new(MemoryPersistence::new());
    let connection = Arc::new(ConnectionChecker::new(
        ConnectionType::All,
        NetworkType::Unmetered,
    ));
    let manager = manager_with(&config, &network, &memory, &connection);
    manager.start().await.unwrap();

    TestManager {
        manager,
        network,
        memory,
        connection,
        config,
        temp_dir,
    }
}

/// A manager sharing the given fakes, not yet started
pub(crate) fn manager_with(
    config: &Config,
    network: &Arc<FakeNetwork>,
    memory: &Arc<MemoryPersistence>,
    connection: &Arc<ConnectionChecker>,
) -> DownloadManager {
    DownloadManager::with_collaborators(
        config.clone(),
        memory.clone(),
        collaborators(network, Vec::new()),
        Arc::clone(connection),
    )
    .unwrap()
}

/// Wait until `id` reports `status` on `events`, returning that update
pub(crate) async fn wait_for_status(
    events: &mut broadcast::Receiver<DownloadBatchStatus>,
    id: &BatchId,
    status: Status,
) -> DownloadBatchStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(update) if &update.batch_id == id && update.status == status => {
                    return update;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("status channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {id} to become {status}"))
}

/// Poll `condition` until it holds, failing after five seconds
pub(crate) async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
