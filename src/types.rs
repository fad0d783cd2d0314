//! Core types for batch-dl

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::utils::{hashed_id, sanitize_id};

/// Identifier of a batch
///
/// Sanitised on construction: anything outside `[A-Za-z0-9._-]` is replaced with `_`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Create a sanitised BatchId, rejecting identifiers that are empty after sanitisation
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let id = sanitize_id(raw.as_ref());
        if id.is_empty() {
            return Err(Error::InvalidBatch(format!(
                "batch id {:?} is empty after sanitisation",
                raw.as_ref()
            )));
        }
        Ok(Self(id))
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a file within a batch
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Create a sanitised FileId, rejecting identifiers that are empty after sanitisation
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let id = sanitize_id(raw.as_ref());
        if id.is_empty() {
            return Err(Error::InvalidBatch(format!(
                "file id {:?} is empty after sanitisation",
                raw.as_ref()
            )));
        }
        Ok(Self(id))
    }

    /// Default identifier for a file that has no client-supplied id
    pub fn derived(batch_id: &BatchId, url: &str) -> Self {
        Self(hashed_id(&format!("{}{}", batch_id.as_str(), url)))
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte counters of a single file
///
/// A `total_bytes` of zero or less means the total size is not known yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSize {
    /// Bytes already persisted
    pub current_bytes: i64,
    /// Total size of the remote file, `<= 0` when unknown
    pub total_bytes: i64,
}

impl FileSize {
    /// A size with nothing downloaded and an unknown total
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Create a FileSize, clamping the current size to a known total
    pub fn new(current_bytes: i64, total_bytes: i64) -> Self {
        let mut size = Self {
            current_bytes: current_bytes.max(0),
            total_bytes,
        };
        size.clamp_current();
        size
    }

    /// Whether the total size is known
    pub fn is_total_known(&self) -> bool {
        self.total_bytes > 0
    }

    /// Whether every byte of a known total has been persisted
    pub fn is_complete(&self) -> bool {
        self.is_total_known() && self.current_bytes == self.total_bytes
    }

    /// Record a newly discovered total
    pub fn set_total(&mut self, total_bytes: i64) {
        self.total_bytes = total_bytes;
        self.clamp_current();
    }

    /// Replace the current size (e.g. with the size found on disk)
    pub fn set_current(&mut self, current_bytes: i64) {
        self.current_bytes = current_bytes.max(0);
        self.clamp_current();
    }

    /// Account for `bytes` more persisted bytes
    pub fn add_current(&mut self, bytes: i64) {
        self.set_current(self.current_bytes.saturating_add(bytes));
    }

    fn clamp_current(&mut self) {
        if self.is_total_known() && self.current_bytes > self.total_bytes {
            self.current_bytes = self.total_bytes;
        }
    }
}

/// Local path of a downloaded file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilePath {
    /// No local file has been created yet
    #[default]
    Unknown,
    /// Absolute path of the local file
    Known(PathBuf),
}

impl FilePath {
    /// Whether no local path has been assigned yet
    pub fn is_unknown(&self) -> bool {
        matches!(self, FilePath::Unknown)
    }

    /// The path, if known
    pub fn as_path(&self) -> Option<&std::path::Path> {
        match self {
            FilePath::Unknown => None,
            FilePath::Known(path) => Some(path),
        }
    }
}

/// A file as declared by the client when building a batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSpec {
    url: String,
    file_id: Option<String>,
    relative_path: Option<String>,
    declared_size: Option<i64>,
}

impl FileSpec {
    /// A file fetched from `url` with a derived id and default path
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Use a client-supplied file id
    pub fn with_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Store the file under `relative_path` inside the batch directory
    pub fn with_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }

    /// Declare the total size up front, skipping the size probe
    pub fn with_size(mut self, total_bytes: i64) -> Self {
        self.declared_size = Some(total_bytes);
        self
    }
}

/// A validated file entry of a [`Batch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFile {
    /// Identifier, unique within the batch
    pub file_id: FileId,
    /// Network address of the file
    pub url: String,
    /// Optional path override relative to the batch directory
    pub relative_path: Option<String>,
    /// Size declared by the client, if any
    pub declared_size: Option<i64>,
}

/// An immutable group of files downloaded and tracked together
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    id: BatchId,
    title: String,
    files: Vec<BatchFile>,
}

impl Batch {
    /// Start building a batch
    pub fn builder(id: impl Into<String>, title: impl Into<String>) -> BatchBuilder {
        BatchBuilder {
            id: id.into(),
            title: title.into(),
            files: Vec::new(),
        }
    }

    /// Batch identifier
    pub fn id(&self) -> &BatchId {
        &self.id
    }

    /// Display title
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Files in declaration order
    pub fn files(&self) -> &[BatchFile] {
        &self.files
    }
}

/// Builder for [`Batch`]
#[derive(Debug)]
pub struct BatchBuilder {
    id: String,
    title: String,
    files: Vec<FileSpec>,
}

impl BatchBuilder {
    /// Add a file by url with default settings
    pub fn add_file(mut self, url: impl Into<String>) -> Self {
        self.files.push(FileSpec::new(url));
        self
    }

    /// Add a fully specified file
    pub fn add(mut self, spec: FileSpec) -> Self {
        self.files.push(spec);
        self
    }

    /// Validate and build the batch
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBatch`] if the batch has no files, a url does not parse,
    /// an identifier is empty after sanitisation, two files share a [`FileId`], or a
    /// relative path tries to escape the batch directory.
    pub fn build(self) -> Result<Batch> {
        let id = BatchId::new(&self.id)?;
        if self.files.is_empty() {
            return Err(Error::InvalidBatch(format!("batch {id} has no files")));
        }

        let mut seen = HashSet::with_capacity(self.files.len());
        let mut files = Vec::with_capacity(self.files.len());
        for spec in self.files {
            url::Url::parse(&spec.url)
                .map_err(|e| Error::InvalidBatch(format!("invalid url {:?}: {}", spec.url, e)))?;

            let file_id = match &spec.file_id {
                Some(raw) => FileId::new(raw)?,
                None => FileId::derived(&id, &spec.url),
            };
            if !seen.insert(file_id.clone()) {
                return Err(Error::InvalidBatch(format!(
                    "duplicate file id {file_id} in batch {id}"
                )));
            }

            if let Some(path) = &spec.relative_path {
                let escapes = std::path::Path::new(path).components().any(|c| {
                    !matches!(
                        c,
                        std::path::Component::Normal(_) | std::path::Component::CurDir
                    )
                });
                if escapes || path.is_empty() {
                    return Err(Error::InvalidBatch(format!(
                        "file path {path:?} must be relative to the batch directory"
                    )));
                }
            }

            files.push(BatchFile {
                file_id,
                url: spec.url,
                relative_path: spec.relative_path,
                declared_size: spec.declared_size.filter(|size| *size > 0),
            });
        }

        Ok(Batch {
            id,
            title: self.title,
            files,
        })
    }
}

/// Lifecycle state of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be driven
    Queued,
    /// Files are being fetched
    Downloading,
    /// Paused by the client
    Paused,
    /// Deletion requested, bytes and metadata being removed
    Deleting,
    /// Deletion completed; the last status a batch ever reports
    Deleted,
    /// Stopped with an error
    Error,
    /// Every file has been downloaded
    Downloaded,
    /// Held until a permitted network is available
    WaitingForNetwork,
}

impl Status {
    /// Whether the batch may move from `self` to `next`
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match self {
            Queued => matches!(
                next,
                Downloading | Paused | Deleting | Error | WaitingForNetwork
            ),
            // Queued again when a run is interrupted by shutdown
            Downloading => matches!(
                next,
                Queued | Downloaded | Error | Paused | Deleting | WaitingForNetwork
            ),
            Paused => matches!(next, Queued | Deleting),
            WaitingForNetwork => matches!(next, Queued | Paused | Deleting),
            Error => matches!(next, Queued | Deleting | WaitingForNetwork),
            Downloaded => matches!(next, Deleting),
            Deleting => matches!(next, Deleted),
            Deleted => false,
        }
    }

    /// String form used by the persistence gateway
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::Deleting => "deleting",
            Status::Deleted => "deleted",
            Status::Error => "error",
            Status::Downloaded => "downloaded",
            Status::WaitingForNetwork => "waiting_for_network",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => Status::Queued,
            "downloading" => Status::Downloading,
            "paused" => Status::Paused,
            "deleting" => Status::Deleting,
            "deleted" => Status::Deleted,
            "error" => Status::Error,
            "downloaded" => Status::Downloaded,
            "waiting_for_network" => Status::WaitingForNetwork,
            other => return Err(Error::Other(format!("unknown batch status {other:?}"))),
        })
    }
}

/// Lifecycle state of a single file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Waiting to be driven
    Queued,
    /// Bytes are being streamed
    Downloading,
    /// Paused by the client
    Paused,
    /// Marked for deletion
    Deletion,
    /// Stopped with an error
    Error,
    /// All bytes persisted
    Downloaded,
    /// Held until a permitted network is available
    WaitingForNetwork,
}

impl FileStatus {
    /// Whether the file may move from `self` to `next`
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        match self {
            Queued => matches!(
                next,
                Downloading | Paused | Deletion | Error | WaitingForNetwork
            ),
            Downloading => matches!(
                next,
                Downloaded | Error | Paused | Deletion | WaitingForNetwork
            ),
            Paused => matches!(next, Queued | Deletion),
            WaitingForNetwork => matches!(next, Queued | Paused | Deletion),
            Error => matches!(next, Queued | Deletion),
            Downloaded => matches!(next, Deletion),
            Deletion => false,
        }
    }

    /// String form used by the persistence gateway
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::Downloading => "downloading",
            FileStatus::Paused => "paused",
            FileStatus::Deletion => "deletion",
            FileStatus::Error => "error",
            FileStatus::Downloaded => "downloaded",
            FileStatus::WaitingForNetwork => "waiting_for_network",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => FileStatus::Queued,
            "downloading" => FileStatus::Downloading,
            "paused" => FileStatus::Paused,
            "deletion" => FileStatus::Deletion,
            "error" => FileStatus::Error,
            "downloaded" => FileStatus::Downloaded,
            "waiting_for_network" => FileStatus::WaitingForNetwork,
            other => return Err(Error::Other(format!("unknown file status {other:?}"))),
        })
    }
}

/// Why a file or batch stopped downloading
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorKind {
    /// Bytes on disk disagree with the expected size
    SizeMismatch,
    /// The total size of a file could not be determined
    SizeRequestFailed,
    /// A storage requirement rule rejected the file
    InsufficientSpace,
    /// The storage location cannot be written to
    StorageUnwritable,
    /// Opening or writing the local file failed
    WriteFailed,
    /// The network transfer failed
    NetworkError,
    /// A batch requirement rule was violated
    RequirementRuleViolated,
    /// Anything else
    Unknown,
}

impl DownloadErrorKind {
    /// String form used by the persistence gateway
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorKind::SizeMismatch => "size_mismatch",
            DownloadErrorKind::SizeRequestFailed => "size_request_failed",
            DownloadErrorKind::InsufficientSpace => "insufficient_space",
            DownloadErrorKind::StorageUnwritable => "storage_unwritable",
            DownloadErrorKind::WriteFailed => "write_failed",
            DownloadErrorKind::NetworkError => "network_error",
            DownloadErrorKind::RequirementRuleViolated => "requirement_rule_violated",
            DownloadErrorKind::Unknown => "unknown",
        }
    }

    /// Parse the persisted form; unrecognised values map to [`DownloadErrorKind::Unknown`]
    pub fn parse(s: &str) -> Self {
        match s {
            "size_mismatch" => DownloadErrorKind::SizeMismatch,
            "size_request_failed" => DownloadErrorKind::SizeRequestFailed,
            "insufficient_space" => DownloadErrorKind::InsufficientSpace,
            "storage_unwritable" => DownloadErrorKind::StorageUnwritable,
            "write_failed" => DownloadErrorKind::WriteFailed,
            "network_error" => DownloadErrorKind::NetworkError,
            "requirement_rule_violated" => DownloadErrorKind::RequirementRuleViolated,
            _ => DownloadErrorKind::Unknown,
        }
    }
}

/// A download failure, carried as data on file and batch statuses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadError {
    /// Failure category
    pub kind: DownloadErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl DownloadError {
    /// Create a new DownloadError
    pub fn new(kind: DownloadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this failure was caused by the network and may be recovered automatically
    pub fn is_network(&self) -> bool {
        self.kind == DownloadErrorKind::NetworkError
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// `floor(downloaded * 100 / total)`, or 0 when the total is unknown
pub fn percentage_of(downloaded: i64, total: i64) -> u8 {
    if total <= 0 || downloaded <= 0 {
        return 0;
    }
    let pct = (downloaded as i128 * 100) / total as i128;
    pct.min(100) as u8
}

/// Aggregate status of a batch as delivered to callbacks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBatchStatus {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Batch title
    pub title: String,
    /// Lifecycle state
    pub status: Status,
    /// Sum of persisted bytes across files
    pub bytes_downloaded: i64,
    /// Sum of file totals, `<= 0` while unknown
    pub bytes_total: i64,
    /// Derived from the byte counts, see [`percentage_of`]
    pub percentage: u8,
    /// Most recently reported error, if the batch is in error
    pub error: Option<DownloadError>,
    /// Whether the client acknowledged the completion notification
    pub notification_seen: bool,
}

impl DownloadBatchStatus {
    /// A fresh queued status
    pub fn queued(batch_id: BatchId, title: impl Into<String>) -> Self {
        Self {
            batch_id,
            title: title.into(),
            status: Status::Queued,
            bytes_downloaded: 0,
            bytes_total: 0,
            percentage: 0,
            error: None,
            notification_seen: false,
        }
    }

    /// Update the byte counters and recompute the percentage
    pub fn set_bytes(&mut self, downloaded: i64, total: i64) {
        self.bytes_total = total;
        self.bytes_downloaded = if total > 0 {
            downloaded.clamp(0, total)
        } else {
            downloaded.max(0)
        };
        self.percentage = percentage_of(self.bytes_downloaded, self.bytes_total);
    }
}

/// Snapshot of a single file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileStatus {
    /// Owning batch
    pub batch_id: BatchId,
    /// File identifier
    pub file_id: FileId,
    /// Lifecycle state
    pub status: FileStatus,
    /// Byte counters
    pub file_size: FileSize,
    /// Local path
    pub path: FilePath,
    /// Error, when the file is in error
    pub error: Option<DownloadError>,
}

/// Which networks downloads may use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Any connected network
    #[default]
    All,
    /// Only unmetered networks (e.g. Wi-Fi)
    Unmetered,
    /// Only metered networks
    Metered,
}

/// The network currently available to the process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// No connectivity
    None,
    /// A metered network
    Metered,
    /// An unmetered network
    #[default]
    Unmetered,
}

impl ConnectionType {
    /// Whether `network` satisfies this constraint
    pub fn permits(self, network: NetworkType) -> bool {
        match (self, network) {
            (_, NetworkType::None) => false,
            (ConnectionType::All, _) => true,
            (ConnectionType::Unmetered, NetworkType::Unmetered) => true,
            (ConnectionType::Metered, NetworkType::Metered) => true,
            _ => false,
        }
    }
}
