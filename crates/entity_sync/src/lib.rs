#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]

/// Engine configuration
pub mod config;

/// CRDT documents, persistence, undo and the sync manager
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Entity keys, records and origin tags
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use types::{
    ChangeSet, ENTITY_KEY_SEPARATOR, EntityKey, EntityRecord, LOCAL_EDITOR_ORIGIN,
    LOCAL_SYNC_MANAGER_ORIGIN, MetaPatch, PERSISTENCE_ORIGIN, SyncCapability,
};

#[cfg(test)]
pub mod test_utils;
