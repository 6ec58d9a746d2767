//! Snapshot persistence inside the entity record's `meta`.
//!
//! The engine stores the serialized CRDT document under one reserved key of
//! the record's `meta` mapping. On load, a stored snapshot is merged into the
//! live document and then checked against the record's current fields: if
//! the record was edited through a path that bypassed the CRDT, the snapshot
//! is stale and the record has to be applied on top.

use super::codec;
use super::entity_doc::EntityDoc;
use super::sync_config::EntitySyncConfig;
use crate::types::{EntityRecord, MetaPatch, PERSISTENCE_ORIGIN};

/// Reserved `meta` key holding the persisted CRDT snapshot.
pub const CRDT_DOC_META_PERSISTENCE_KEY: &str = "_crdt_document";

/// Outcome of reconciling a persisted snapshot with the live record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// No usable snapshot was stored.
    Missing,
    /// The snapshot agrees with every field of the record.
    Valid,
    /// The snapshot disagrees with the record on these fields.
    Stale { changed_fields: Vec<String> },
}

impl SnapshotStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SnapshotStatus::Valid)
    }
}

/// Read the persisted snapshot out of a record, if there is a usable one.
pub fn read_persisted(record: &EntityRecord) -> Option<EntityDoc> {
    let serialized = record.meta_value(CRDT_DOC_META_PERSISTENCE_KEY)?;
    codec::deserialize(serialized)
}

/// Build the `meta` patch that persists `doc`.
///
/// The record itself is left untouched; the caller merges the patch.
pub fn write_persisted(doc: &EntityDoc) -> MetaPatch {
    let mut patch = MetaPatch::new();
    patch.insert(
        CRDT_DOC_META_PERSISTENCE_KEY.to_string(),
        codec::serialize(doc),
    );
    patch
}

/// Merge `persisted` into `target`, then report whether it matches `record`.
///
/// The merge always happens, valid or not: a replica joining a session must
/// keep whatever history the snapshot carries rather than rebuild its state
/// from the record alone.
pub fn is_still_valid(
    persisted: &EntityDoc,
    target: &EntityDoc,
    record: &EntityRecord,
    config: &dyn EntitySyncConfig,
) -> bool {
    merge_and_check(persisted, target, record, config).is_valid()
}

/// [`is_still_valid`] with the list of disagreeing fields.
pub fn merge_and_check(
    persisted: &EntityDoc,
    target: &EntityDoc,
    record: &EntityRecord,
    config: &dyn EntitySyncConfig,
) -> SnapshotStatus {
    if let Err(e) = target.apply_update_v2(&persisted.encode_state_as_update_v2(), PERSISTENCE_ORIGIN)
    {
        log::warn!("Failed to merge persisted CRDT snapshot: {}", e);
        return SnapshotStatus::Missing;
    }

    let invalidations = config.get_changes_from_crdt_doc(persisted, record);
    if invalidations.is_empty() {
        return SnapshotStatus::Valid;
    }

    let changed_fields: Vec<String> = invalidations.into_keys().collect();
    log::info!(
        "Persisted CRDT snapshot is stale; fields changed outside the CRDT: {:?}",
        changed_fields
    );
    SnapshotStatus::Stale { changed_fields }
}

/// Read the snapshot stored in `record` and reconcile it into `target`.
pub fn apply_persisted(
    target: &EntityDoc,
    record: &EntityRecord,
    config: &dyn EntitySyncConfig,
) -> SnapshotStatus {
    match read_persisted(record) {
        Some(persisted) => merge_and_check(&persisted, target, record, config),
        None => SnapshotStatus::Missing,
    }
}
