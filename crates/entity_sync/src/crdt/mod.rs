#![doc = include_str!(concat!(env!("OUT_DIR"), "/crdt_README.md"))]

mod codec;
mod entity_doc;
mod handlers;
mod memory_relay;
mod persistence;
mod sync_config;
mod sync_manager;
mod undo;

#[cfg(test)]
pub(crate) use handlers::block_on_test;

pub use codec::{deserialize, serialize};
pub use entity_doc::{
    CRDT_DOC_VERSION, DocMeta, EntityDoc, META_FROM_PERSISTENCE_KEY, META_OBJECT_TYPE_KEY,
    RECORD_MAP_NAME, RecordCommit, RecordTxn, STATE_MAP_NAME, STATE_VERSION_KEY,
};
pub use handlers::{BoxFuture, Provider, ProviderFactory, RecordHandlers};
pub use memory_relay::{MemoryRelay, RELAY_ORIGIN, RelayConnection};
pub use persistence::{
    CRDT_DOC_META_PERSISTENCE_KEY, SnapshotStatus, apply_persisted, is_still_valid,
    merge_and_check, read_persisted, write_persisted,
};
pub use sync_config::{EntitySyncConfig, FieldSyncConfig};
pub use sync_manager::{EntityPhase, SyncManager};
pub use undo::{HistoryRecords, MultiDocUndoManager, UndoHistory};
