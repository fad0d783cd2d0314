//! Builds [`DownloadBatch`]es from client batches and from checkpoints.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use super::checkpoint::Checkpointer;
use super::download_batch::{BatchParts, DownloadBatch};
use super::file::{DownloadFile, FileCollaborators, FileEntry};
use super::rules::DownloadBatchRequirementRule;
use crate::config::{Config, FileDownloadMode, ThrottleMode};
use crate::connection::ConnectionChecker;
use crate::db::{BatchRecord, FileRecord};
use crate::error::Result;
use crate::throttle::{StatusCallback, create_throttle};
use crate::types::{
    Batch, BatchId, DownloadBatchStatus, DownloadError, DownloadErrorKind, FileId, FilePath,
    FileSize, FileStatus, Status,
};
use crate::utils::file_name_from_url;

/// Wires batches to the shared collaborators
pub struct BatchFactory {
    download_dir: PathBuf,
    mode: FileDownloadMode,
    throttle_mode: ThrottleMode,
    collaborators: FileCollaborators,
    rules: Arc<Vec<Arc<dyn DownloadBatchRequirementRule>>>,
    connection: Arc<ConnectionChecker>,
    checkpointer: Checkpointer,
    callback: StatusCallback,
}

impl BatchFactory {
    /// Create a factory; every batch it builds reports to `callback`
    pub fn new(
        config: &Config,
        collaborators: FileCollaborators,
        rules: Vec<Arc<dyn DownloadBatchRequirementRule>>,
        connection: Arc<ConnectionChecker>,
        checkpointer: Checkpointer,
        callback: StatusCallback,
    ) -> Self {
        Self {
            download_dir: config.download_dir().clone(),
            mode: config.download.file_download_mode,
            throttle_mode: config.throttle.mode,
            collaborators,
            rules: Arc::new(rules),
            connection,
            checkpointer,
            callback,
        }
    }

    /// Directory holding the files of batch `id`
    pub fn batch_directory(&self, id: &BatchId) -> PathBuf {
        self.download_dir.join(id.as_str())
    }

    /// A fresh, queued batch
    ///
    /// Files land in `<download_dir>/<batch_id>/`, under their relative path
    /// or the last url segment. Clashing names are prefixed with the file id.
    pub fn create(&self, batch: &Batch) -> DownloadBatch {
        let directory = self.batch_directory(batch.id());
        let mut used = HashSet::new();
        let entries = batch
            .files()
            .iter()
            .enumerate()
            .map(|(position, file)| {
                let name = file
                    .relative_path
                    .clone()
                    .unwrap_or_else(|| file_name_from_url(&file.url, file.file_id.as_str()));
                let name = if used.insert(name.clone()) {
                    name
                } else {
                    let prefixed = format!("{}_{}", file.file_id, name);
                    used.insert(prefixed.clone());
                    prefixed
                };
                FileEntry::queued(
                    file.file_id.clone(),
                    file.url.clone(),
                    directory.join(name),
                    position,
                    file.declared_size,
                )
            })
            .collect();

        self.assemble(
            DownloadBatchStatus::queued(batch.id().clone(), batch.title()),
            0,
            directory,
            entries,
        )
    }

    /// A batch restored from its checkpoint
    ///
    /// A batch checkpointed while downloading was cut off mid-run and comes
    /// back queued. Files of a queued batch that were stopped come back queued
    /// as well.
    pub fn reconstruct(&self, record: &BatchRecord, files: &[FileRecord]) -> Result<DownloadBatch> {
        let id = BatchId::new(&record.id)?;
        let mut status: Status = record.status.parse()?;
        if status == Status::Downloading {
            status = Status::Queued;
        }

        let mut batch_status = DownloadBatchStatus::queued(id.clone(), &record.title);
        batch_status.status = status;
        batch_status.notification_seen = record.notification_seen;
        batch_status.set_bytes(record.downloaded_bytes, record.total_bytes);
        if status == Status::Error {
            batch_status.error = Some(DownloadError::new(
                record
                    .error_kind
                    .as_deref()
                    .map(DownloadErrorKind::parse)
                    .unwrap_or(DownloadErrorKind::Unknown),
                record.error_message.clone().unwrap_or_default(),
            ));
        }

        let entries = files
            .iter()
            .map(|file| {
                let mut file_status: FileStatus = file.status.parse()?;
                let stopped = matches!(
                    file_status,
                    FileStatus::Paused | FileStatus::WaitingForNetwork | FileStatus::Error
                );
                if file_status == FileStatus::Downloading || (status == Status::Queued && stopped) {
                    file_status = FileStatus::Queued;
                }
                let target = PathBuf::from(&file.path);
                Ok(FileEntry {
                    file_id: FileId::new(&file.file_id)?,
                    url: file.url.clone(),
                    path: if file.current_bytes > 0 {
                        FilePath::Known(target.clone())
                    } else {
                        FilePath::Unknown
                    },
                    target,
                    position: file.position.max(0) as usize,
                    status: file_status,
                    file_size: FileSize::new(file.current_bytes, file.total_bytes),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let directory = self.batch_directory(&id);
        Ok(self.assemble(batch_status, record.created_at, directory, entries))
    }

    fn assemble(
        &self,
        status: DownloadBatchStatus,
        created_at: i64,
        directory: PathBuf,
        entries: Vec<FileEntry>,
    ) -> DownloadBatch {
        let id = status.batch_id.clone();
        let files = entries
            .into_iter()
            .map(|entry| {
                DownloadFile::new(
                    id.clone(),
                    entry,
                    &self.collaborators,
                    self.checkpointer.clone(),
                )
            })
            .collect();

        DownloadBatch::new(BatchParts {
            status,
            created_at,
            directory,
            files,
            mode: self.mode,
            rules: Arc::clone(&self.rules),
            connection: Arc::clone(&self.connection),
            throttle: create_throttle(self.throttle_mode, Arc::clone(&self.callback)),
            checkpointer: self.checkpointer.clone(),
        })
    }
}
