//! Local byte sinks for downloaded files.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use super::rules::{StorageRequirementRule, first_violation};
use crate::types::FileSize;
use crate::utils::get_disk_space;

/// Outcome of [`FilePersistence::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePersistenceResult {
    /// The sink is open and ready for writes
    Success,
    /// A storage requirement rule rejected the file
    ErrorInsufficientSpace(String),
    /// The target location cannot be written to
    ErrorStorageUnwritable(String),
    /// The file could not be opened
    ErrorOpeningFile(String),
    /// Space cannot be checked without knowing the total size
    ErrorUnknownTotalFileSize,
}

/// Open/write/close/delete of one local file
///
/// Writes are synchronous and positional. A single instance is used by one
/// file at a time.
pub trait FilePersistence: Send {
    /// Open (creating if needed) the file at `path` for a download of `file_size`
    fn create(&mut self, path: &Path, file_size: FileSize) -> FilePersistenceResult;

    /// Write `buffer` at byte `offset`; `false` on failure
    fn write(&mut self, buffer: &[u8], offset: u64) -> bool;

    /// Bytes currently stored at `path`, 0 if the file does not exist
    fn current_size(&self, path: &Path) -> i64;

    /// Close the sink and remove the file at `path`
    fn delete(&mut self, path: &Path);

    /// Flush and close the sink
    fn close(&mut self);
}

/// Creates one [`FilePersistence`] per file
pub trait FilePersistenceCreator: Send + Sync {
    /// A fresh, closed sink
    fn create(&self) -> Box<dyn FilePersistence>;
}

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &File, _buf: &[u8], _offset: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "positional writes not supported on this platform",
    ))
}

/// [`FilePersistence`] on the local filesystem
pub struct LocalFilePersistence {
    file: Option<File>,
    rules: Arc<Vec<Arc<dyn StorageRequirementRule>>>,
}

impl LocalFilePersistence {
    /// Create a closed sink guarded by `rules`
    pub fn new(rules: Arc<Vec<Arc<dyn StorageRequirementRule>>>) -> Self {
        Self { file: None, rules }
    }

    fn check_rules(&self, dir: &Path, bytes_to_write: u64) -> Option<FilePersistenceResult> {
        if self.rules.is_empty() {
            return None;
        }
        match get_disk_space(dir) {
            Ok(space) => first_violation(&self.rules, space, bytes_to_write)
                .map(FilePersistenceResult::ErrorInsufficientSpace),
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Could not check free space, skipping storage rules"
                );
                None
            }
        }
    }
}

impl FilePersistence for LocalFilePersistence {
    fn create(&mut self, path: &Path, file_size: FileSize) -> FilePersistenceResult {
        if !file_size.is_total_known() {
            return FilePersistenceResult::ErrorUnknownTotalFileSize;
        }
        self.close();

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = std::fs::create_dir_all(dir) {
            return FilePersistenceResult::ErrorStorageUnwritable(format!(
                "cannot create {}: {}",
                dir.display(),
                e
            ));
        }

        let on_disk = self.current_size(path);
        let bytes_to_write = (file_size.total_bytes - on_disk).max(0) as u64;
        if let Some(violation) = self.check_rules(dir, bytes_to_write) {
            return violation;
        }

        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
        {
            Ok(file) => {
                self.file = Some(file);
                FilePersistenceResult::Success
            }
            Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem) => {
                FilePersistenceResult::ErrorStorageUnwritable(format!(
                    "{} is not writable: {}",
                    path.display(),
                    e
                ))
            }
            Err(e) => FilePersistenceResult::ErrorOpeningFile(format!(
                "cannot open {}: {}",
                path.display(),
                e
            )),
        }
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        match write_all_at(file, buffer, offset) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(offset, error = %e, "Write to local file failed");
                false
            }
        }
    }

    fn current_size(&self, path: &Path) -> i64 {
        std::fs::metadata(path)
            .map(|meta| meta.len() as i64)
            .unwrap_or(0)
    }

    fn delete(&mut self, path: &Path) {
        self.file = None;
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Deleted local file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete local file"),
        }
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take()
            && let Err(e) = file.sync_data()
        {
            tracing::warn!(error = %e, "Failed to flush local file on close");
        }
    }
}

/// Creates [`LocalFilePersistence`] sinks sharing one rule set
#[derive(Clone)]
pub struct LocalFilePersistenceCreator {
    rules: Arc<Vec<Arc<dyn StorageRequirementRule>>>,
}

impl LocalFilePersistenceCreator {
    /// Create a factory whose sinks check `rules`
    pub fn new(rules: Vec<Arc<dyn StorageRequirementRule>>) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }
}

impl FilePersistenceCreator for LocalFilePersistenceCreator {
    fn create(&self) -> Box<dyn FilePersistence> {
        Box::new(LocalFilePersistence::new(Arc::clone(&self.rules)))
    }
}
