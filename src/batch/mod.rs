//! Batches and their files.
//!
//! - [`DownloadBatch`] - batch state machine, drives its files and aggregates progress
//! - [`DownloadFile`] - file state machine: size discovery, resume, streaming
//! - [`BatchFactory`] - builds batches from client input and from checkpoints
//! - [`Checkpointer`] - ordered writer in front of the persistence gateway
//! - [`rules`] - batch admission rules

mod checkpoint;
mod download_batch;
mod factory;
mod file;
pub mod rules;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use checkpoint::{Checkpoint, Checkpointer};
pub use download_batch::{BatchOutcome, DownloadBatch};
pub use factory::BatchFactory;
pub use file::{DownloadFile, FileCollaborators, FileProgress};
pub use rules::{DownloadBatchRequirementRule, MaxBatchSizeRule, batch_rules_from_config};
