//! # batch-dl
//!
//! Resumable batch download orchestration for Rust applications.
//!
//! ## Design Philosophy
//!
//! batch-dl is designed to be:
//! - **Resumable** - Every transition is checkpointed; a restart continues where it stopped
//! - **Byte-exact** - Paused and interrupted files resume from the bytes already on disk
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers register callbacks or subscribe, no polling required
//!
//! A batch is a group of files downloaded and tracked together. The
//! [`DownloadManager`] drives each batch through its files, aggregates
//! progress into one [`DownloadBatchStatus`] per batch, and reschedules work
//! when a network failure clears.
//!
//! ## Quick Start
//!
//! ```no_run
//! use batch_dl::{Batch, Config, DownloadManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = DownloadManager::new(Config::default()).await?;
//!     manager.start().await?;
//!
//!     // Subscribe to status updates
//!     let mut updates = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(status) = updates.recv().await {
//!             println!("{} {} {}%", status.batch_id, status.status, status.percentage);
//!         }
//!     });
//!
//!     let batch = Batch::builder("holiday-photos", "Holiday photos")
//!         .add_file("https://example.com/photos/001.jpg")
//!         .add_file("https://example.com/photos/002.jpg")
//!         .build()?;
//!     manager.submit(batch).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch and file state machines
pub mod batch;
/// Configuration types
pub mod config;
/// Network policy and detected network
pub mod connection;
/// Durable checkpoint store
pub mod db;
/// Download manager (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Network collaborators: streaming and size discovery
pub mod network;
/// Recovery after network failures with exponential backoff
pub mod recovery;
/// Local byte sinks and storage rules
pub mod storage;
/// Status callback throttling
pub mod throttle;
/// Core types and statuses
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, DownloadsPersistence, MemoryPersistence};
pub use downloader::{CallbackId, DownloadManager};
pub use error::{DatabaseError, Error, Result};
pub use types::{
    Batch, BatchId, ConnectionType, DownloadBatchStatus, DownloadError, DownloadErrorKind,
    DownloadFileStatus, FileId, FileSize, FileSpec, FileStatus, NetworkType, Status,
};

/// Helper function to run the manager with graceful signal handling.
///
/// Waits for a termination signal and then calls the manager's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use batch_dl::{Config, DownloadManager, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = DownloadManager::new(Config::default()).await?;
///     manager.start().await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(manager).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(manager: DownloadManager) -> Result<()> {
    wait_for_signal().await;
    manager.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
