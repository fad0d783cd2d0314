use super::test_helpers::*;
use super::*;
use crate::batch::test_helpers::FakeNetwork;
use crate::types::{Batch, FileId, FileSpec, FileStatus, Status};
use std::time::Duration;

mod connection;

fn batch_id(id: &str) -> BatchId {
    BatchId::new(id).unwrap()
}

fn single_file_batch(id: &str, url: &str) -> Batch {
    Batch::builder(id, format!("Batch {id}"))
        .add(FileSpec::new(url).with_id("f1"))
        .build()
        .unwrap()
}

/// Bytes of `name` in the download directory of batch `id`
fn bytes_on_disk(t: &TestManager, id: &str, name: &str) -> u64 {
    std::fs::metadata(t.config.download_dir().join(id).join(name))
        .map(|m| m.len())
        .unwrap_or(0)
}

fn no_running_batches(manager: &DownloadManager) -> bool {
    manager.lock_registry().running.is_empty()
}
