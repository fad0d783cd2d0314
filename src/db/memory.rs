//! In-process [`DownloadsPersistence`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{BatchRecord, DownloadsPersistence, FileRecord};
use crate::error::Result;
use crate::types::{BatchId, Status};

#[derive(Default)]
struct Rows {
    batches: HashMap<String, BatchRecord>,
    files: HashMap<String, Vec<FileRecord>>,
    // Monotonic stand-in for timestamps so insertion order survives equal clocks
    sequence: i64,
}

/// Gateway keeping every checkpoint in memory
///
/// Each call holds one lock for its whole duration, so calls are atomic.
#[derive(Default)]
pub struct MemoryPersistence {
    rows: Mutex<Rows>,
}

impl MemoryPersistence {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn upsert_file(rows: &mut Rows, file: &FileRecord) {
        if !rows.batches.contains_key(&file.batch_id) {
            return;
        }
        let files = rows.files.entry(file.batch_id.clone()).or_default();
        match files.iter_mut().find(|f| f.file_id == file.file_id) {
            Some(existing) => *existing = file.clone(),
            None => files.push(file.clone()),
        }
        files.sort_by_key(|f| f.position);
    }
}

#[async_trait]
impl DownloadsPersistence for MemoryPersistence {
    async fn persist_batch(&self, batch: &BatchRecord, files: &[FileRecord]) -> Result<()> {
        let mut rows = self.rows();
        rows.sequence += 1;
        let sequence = rows.sequence;
        let created_at = rows
            .batches
            .get(&batch.id)
            .map(|existing| existing.created_at)
            .unwrap_or(if batch.created_at > 0 {
                batch.created_at
            } else {
                sequence
            });
        let mut record = batch.clone();
        record.created_at = created_at;
        record.updated_at = sequence;
        rows.batches.insert(record.id.clone(), record);
        for file in files {
            Self::upsert_file(&mut rows, file);
        }
        Ok(())
    }

    async fn load_batches(&self) -> Result<Vec<BatchRecord>> {
        let rows = self.rows();
        let mut batches: Vec<_> = rows.batches.values().cloned().collect();
        batches.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(batches)
    }

    async fn load_files(&self, batch_id: &BatchId) -> Result<Vec<FileRecord>> {
        Ok(self
            .rows()
            .files
            .get(batch_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_file(&self, file: &FileRecord) -> Result<()> {
        Self::upsert_file(&mut self.rows(), file);
        Ok(())
    }

    async fn delete_batch(&self, batch_id: &BatchId) -> Result<()> {
        let mut rows = self.rows();
        rows.batches.remove(batch_id.as_str());
        rows.files.remove(batch_id.as_str());
        Ok(())
    }

    async fn update_status(&self, batch_id: &BatchId, status: Status) -> Result<()> {
        if let Some(batch) = self.rows().batches.get_mut(batch_id.as_str()) {
            batch.status = status.as_str().to_string();
        }
        Ok(())
    }

    async fn update_notification_seen(&self, batch_id: &BatchId, seen: bool) -> Result<()> {
        if let Some(batch) = self.rows().batches.get_mut(batch_id.as_str()) {
            batch.notification_seen = seen;
        }
        Ok(())
    }
}
