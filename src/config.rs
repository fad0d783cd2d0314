//! Configuration types for batch-dl

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::types::ConnectionType;

/// How the files of one batch are driven
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FileDownloadMode {
    /// One file after another, sharing a single connection budget
    #[default]
    Sequential,
    /// Up to `max_concurrent_files` files of a batch at once
    Concurrent {
        /// Size of the per-batch file pool
        max_concurrent_files: usize,
    },
}

/// Download behavior configuration (directories, concurrency)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root directory; each batch is stored in `<download_dir>/<batch_id>` (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum number of batches downloading at once (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_batches: usize,

    /// Sequential or concurrent file downloads within a batch
    #[serde(default)]
    pub file_download_mode: FileDownloadMode,

    /// Timeout for a single HTTP request, excluding body streaming (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_batches: default_max_concurrent(),
            file_download_mode: FileDownloadMode::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Throttling policy for status callbacks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ThrottleMode {
    /// Forward every update
    Unthrottled,
    /// Coalesce to the latest status and emit at a fixed period
    ByTime {
        /// Emission period in milliseconds
        period_ms: u64,
    },
    /// Emit only when status, percentage or error changed
    #[default]
    ByProgress,
}

/// Status callback configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Throttling policy (default: by_progress)
    #[serde(default)]
    pub mode: ThrottleMode,
}

/// Free-space requirements checked before a local file is created
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bytes that must remain free after the file is fully written
    #[serde(default)]
    pub min_free_bytes: Option<u64>,

    /// Percentage (0-100) of the filesystem that must remain free after the file is written
    #[serde(default)]
    pub min_free_percentage: Option<f64>,
}

/// Batch-level admission rules
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchRulesConfig {
    /// Largest batch (sum of file sizes, in bytes) allowed to download
    #[serde(default)]
    pub max_batch_size_bytes: Option<u64>,
}

/// Network policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Networks downloads may use (default: all)
    #[serde(default)]
    pub allowed_connection_type: ConnectionType,
}

/// Durable state configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./batch-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Recovery job configuration
///
/// Network-caused failures schedule a recovery job. Consecutive jobs back off
/// exponentially from `initial_delay` up to `max_delay`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Tag identifying the recovery job; a new job replaces the outstanding one
    #[serde(default = "default_recovery_tag")]
    pub tag: String,

    /// Delay before the first recovery attempt (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between recovery attempts (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tag: default_recovery_tag(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`crate::DownloadManager`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directories and concurrency
    #[serde(default)]
    pub download: DownloadConfig,

    /// Status callback throttling
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Storage requirement rules
    #[serde(default)]
    pub storage: StorageConfig,

    /// Batch requirement rules
    #[serde(default)]
    pub batch_rules: BatchRulesConfig,

    /// Network policy
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Durable state
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Recovery after network failures
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Download directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Parse a configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work
    ///
    /// Called by [`crate::DownloadManager::new`] so a malformed configuration fails
    /// at construction time instead of mid-download.
    pub fn validate(&self) -> Result<()> {
        if self.download.download_dir.as_os_str().is_empty() {
            return Err(Error::config("download_dir", "must not be empty"));
        }
        if self.download.max_concurrent_batches == 0 {
            return Err(Error::config(
                "max_concurrent_batches",
                "must be at least 1",
            ));
        }
        if let FileDownloadMode::Concurrent {
            max_concurrent_files: 0,
        } = self.download.file_download_mode
        {
            return Err(Error::config("max_concurrent_files", "must be at least 1"));
        }
        if let ThrottleMode::ByTime { period_ms: 0 } = self.throttle.mode {
            return Err(Error::config("period_ms", "must be greater than zero"));
        }
        if let Some(pct) = self.storage.min_free_percentage
            && !(0.0..=100.0).contains(&pct)
        {
            return Err(Error::config(
                "min_free_percentage",
                format!("{pct} is outside 0..=100"),
            ));
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if self.recovery.tag.is_empty() {
            return Err(Error::config("tag", "recovery tag must not be empty"));
        }
        Ok(())
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./batch-dl.db")
}

fn default_recovery_tag() -> String {
    "batch-dl-recovery".to_string()
}

fn default_true() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
