//! Per-entity-type sync configuration.
//!
//! The engine treats entity records as opaque bags of fields. An
//! [`EntitySyncConfig`] supplied by the host decides how those fields map
//! onto an entity's CRDT document and back. [`FieldSyncConfig`] is a generic
//! implementation that syncs either every field or an allow-list of fields.

use std::collections::HashSet;

use serde_json::Value;

use super::entity_doc::{EntityDoc, RecordTxn};
use crate::types::{ChangeSet, EntityRecord, SyncCapability};

/// How records of one object type are synchronized through a CRDT document.
pub trait EntitySyncConfig: Send + Sync {
    /// Write the given field changes into the document's record map.
    ///
    /// Called inside a transaction the engine has already opened and tagged
    /// with the right origin.
    fn apply_changes_to_crdt_doc(&self, txn: &mut RecordTxn<'_>, changes: &ChangeSet);

    /// Compute the fields whose value in the document differs from `record`.
    ///
    /// The returned values are the document's; an empty set means the two
    /// agree.
    fn get_changes_from_crdt_doc(&self, doc: &EntityDoc, record: &EntityRecord) -> ChangeSet;

    /// Whether this entity type declares an optional capability.
    fn supports(&self, _capability: SyncCapability) -> bool {
        false
    }
}

/// Field-by-field sync config.
///
/// Each synced field is stored as its JSON encoding under its own key in the
/// record map. A `null` value removes the field from the document.
#[derive(Debug, Clone, Default)]
pub struct FieldSyncConfig {
    /// Fields to sync; `None` syncs everything.
    synced_fields: Option<HashSet<String>>,
    capabilities: HashSet<SyncCapability>,
}

impl FieldSyncConfig {
    /// Sync every field of the record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync only the named fields.
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            synced_fields: Some(fields.into_iter().map(Into::into).collect()),
            capabilities: HashSet::new(),
        }
    }

    /// Declare a capability (builder pattern).
    pub fn with_capability(mut self, capability: SyncCapability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Whether a field takes part in sync.
    pub fn is_synced(&self, field: &str) -> bool {
        self.synced_fields
            .as_ref()
            .is_none_or(|fields| fields.contains(field))
    }
}

impl EntitySyncConfig for FieldSyncConfig {
    fn apply_changes_to_crdt_doc(&self, txn: &mut RecordTxn<'_>, changes: &ChangeSet) {
        for (field, value) in changes {
            if !self.is_synced(field) {
                continue;
            }
            if value.is_null() {
                txn.remove(field);
            } else if txn.get(field).as_ref() != Some(value) {
                txn.set(field, value);
            }
        }
    }

    fn get_changes_from_crdt_doc(&self, doc: &EntityDoc, record: &EntityRecord) -> ChangeSet {
        let doc_fields = doc.fields();
        let mut changes = ChangeSet::new();

        for (field, doc_value) in &doc_fields {
            if self.is_synced(field) && record.get(field) != Some(doc_value) {
                changes.insert(field.clone(), doc_value.clone());
            }
        }

        // Fields the document no longer has
        for (field, record_value) in &record.fields {
            if self.is_synced(field) && !record_value.is_null() && !doc_fields.contains_key(field)
            {
                changes.insert(field.clone(), Value::Null);
            }
        }

        changes
    }

    fn supports(&self, capability: SyncCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}
