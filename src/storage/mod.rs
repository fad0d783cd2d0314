//! Local storage: byte sinks and free-space admission rules.

pub mod file_persistence;
pub mod rules;

pub use file_persistence::{
    FilePersistence, FilePersistenceCreator, FilePersistenceResult, LocalFilePersistence,
    LocalFilePersistenceCreator,
};
pub use rules::{MinFreeBytesRule, MinFreePercentageRule, StorageRequirementRule, storage_rules_from_config};
