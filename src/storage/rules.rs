//! Free-space admission rules checked before a local file is created.

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::utils::DiskSpace;

/// Predicate blocking a file when the filesystem would run too low on space
pub trait StorageRequirementRule: Send + Sync {
    /// Whether writing `bytes_to_write` more bytes would violate the rule
    fn has_violated_rule(&self, space: DiskSpace, bytes_to_write: u64) -> bool;

    /// Short human-readable description used in error messages
    fn describe(&self) -> String;
}

/// Keeps at least `min_free_bytes` free after the write
#[derive(Debug, Clone, Copy)]
pub struct MinFreeBytesRule {
    min_free_bytes: u64,
}

impl MinFreeBytesRule {
    /// Create a byte-based rule
    pub fn new(min_free_bytes: u64) -> Self {
        Self { min_free_bytes }
    }
}

impl StorageRequirementRule for MinFreeBytesRule {
    fn has_violated_rule(&self, space: DiskSpace, bytes_to_write: u64) -> bool {
        match space.available.checked_sub(bytes_to_write) {
            Some(left) => left < self.min_free_bytes,
            None => true,
        }
    }

    fn describe(&self) -> String {
        format!("at least {} bytes must stay free", self.min_free_bytes)
    }
}

/// Keeps at least `percentage` of the filesystem free after the write
#[derive(Debug, Clone, Copy)]
pub struct MinFreePercentageRule {
    percentage: f64,
}

impl MinFreePercentageRule {
    /// Create a percentage-based rule; `percentage` is clamped to 0..=100
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 100.0),
        }
    }
}

impl StorageRequirementRule for MinFreePercentageRule {
    fn has_violated_rule(&self, space: DiskSpace, bytes_to_write: u64) -> bool {
        let Some(left) = space.available.checked_sub(bytes_to_write) else {
            return true;
        };
        let required = space.total as f64 * self.percentage / 100.0;
        (left as f64) < required
    }

    fn describe(&self) -> String {
        format!("at least {}% of the filesystem must stay free", self.percentage)
    }
}

/// Rules built from [`StorageConfig`]
pub fn storage_rules_from_config(config: &StorageConfig) -> Vec<Arc<dyn StorageRequirementRule>> {
    let mut rules: Vec<Arc<dyn StorageRequirementRule>> = Vec::new();
    if let Some(bytes) = config.min_free_bytes {
        rules.push(Arc::new(MinFreeBytesRule::new(bytes)));
    }
    if let Some(percentage) = config.min_free_percentage {
        rules.push(Arc::new(MinFreePercentageRule::new(percentage)));
    }
    rules
}

/// First rule violated by writing `bytes_to_write`, if any
pub fn first_violation(
    rules: &[Arc<dyn StorageRequirementRule>],
    space: DiskSpace,
    bytes_to_write: u64,
) -> Option<String> {
    rules
        .iter()
        .find(|rule| rule.has_violated_rule(space, bytes_to_write))
        .map(|rule| rule.describe())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn space(available: u64, total: u64) -> DiskSpace {
        DiskSpace { available, total }
    }

    #[test]
    fn byte_rule_checks_space_left_after_write() {
        let rule = MinFreeBytesRule::new(GB);
        assert!(!rule.has_violated_rule(space(3 * GB, 10 * GB), GB));
        assert!(rule.has_violated_rule(space(3 * GB, 10 * GB), 2 * GB + 1));
    }

    #[test]
    fn rules_are_violated_when_file_does_not_fit() {
        let bytes = MinFreeBytesRule::new(0);
        let pct = MinFreePercentageRule::new(0.0);
        assert!(bytes.has_violated_rule(space(100, 1000), 101));
        assert!(pct.has_violated_rule(space(100, 1000), 101));
        assert!(!bytes.has_violated_rule(space(100, 1000), 100));
    }

    #[test]
    fn percentage_rule_uses_filesystem_total() {
        let rule = MinFreePercentageRule::new(10.0);
        // 10% of 1000 = 100 must remain
        assert!(!rule.has_violated_rule(space(500, 1000), 400));
        assert!(rule.has_violated_rule(space(500, 1000), 401));
    }

    #[test]
    fn config_builds_configured_rules_only() {
        assert!(storage_rules_from_config(&StorageConfig::default()).is_empty());

        let config = StorageConfig {
            min_free_bytes: Some(10),
            min_free_percentage: Some(5.0),
        };
        let rules = storage_rules_from_config(&config);
        assert_eq!(rules.len(), 2);
        assert_eq!(
            first_violation(&rules, space(15, 100), 10),
            Some("at least 10 bytes must stay free".to_string())
        );
        assert_eq!(first_violation(&rules, space(50, 100), 10), None);
    }
}
