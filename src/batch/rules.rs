//! Admission rules evaluated once a batch knows its total size.

use std::sync::Arc;

use crate::config::BatchRulesConfig;
use crate::types::DownloadBatchStatus;

/// Predicate that fails a batch before any byte is streamed
pub trait DownloadBatchRequirementRule: Send + Sync {
    /// Whether `status` (with its total size filled in) violates the rule
    fn has_violated_rule(&self, status: &DownloadBatchStatus) -> bool;

    /// Short human-readable description used as the error message
    fn describe(&self) -> String;
}

/// Rejects batches larger than a fixed number of bytes
#[derive(Debug, Clone, Copy)]
pub struct MaxBatchSizeRule {
    max_bytes: u64,
}

impl MaxBatchSizeRule {
    /// Create a size cap
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl DownloadBatchRequirementRule for MaxBatchSizeRule {
    fn has_violated_rule(&self, status: &DownloadBatchStatus) -> bool {
        status.bytes_total > 0 && status.bytes_total as u64 > self.max_bytes
    }

    fn describe(&self) -> String {
        format!("batch is larger than {} bytes", self.max_bytes)
    }
}

/// Rules built from [`BatchRulesConfig`]
pub fn batch_rules_from_config(config: &BatchRulesConfig) -> Vec<Arc<dyn DownloadBatchRequirementRule>> {
    let mut rules: Vec<Arc<dyn DownloadBatchRequirementRule>> = Vec::new();
    if let Some(max) = config.max_batch_size_bytes {
        rules.push(Arc::new(MaxBatchSizeRule::new(max)));
    }
    rules
}
