//! Per-entity CRDT document.
//!
//! This module provides [`EntityDoc`], a Y.Doc holding the synchronized fields
//! of one content entity, plus [`RecordTxn`], the write handle used to mutate
//! those fields inside a single origin-tagged transaction.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "document"   field name → JSON-encoded field value
//! └── Y.Map "state"      "version" → schema version stamp
//! ```
//!
//! Only the "document" map is observed for changes. Alongside the Y.Doc, each
//! `EntityDoc` carries a small table of session metadata (entity type, whether
//! it was rebuilt from a snapshot) that is never replicated.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use yrs::block::ClientID;
use yrs::types::{Event, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, DeepObservable, Doc, Map, MapRef, Origin, Out, ReadTxn, StateVector, Subscription,
    Transact, TransactionMut, Update,
};

use crate::error::{Result, SyncError};
use crate::types::{ChangeSet, LOCAL_SYNC_MANAGER_ORIGIN};

/// Name of the Y.Map holding the synchronized entity fields.
pub const RECORD_MAP_NAME: &str = "document";

/// Name of the Y.Map holding document-level state.
pub const STATE_MAP_NAME: &str = "state";

/// Key of the schema version inside the state map.
pub const STATE_VERSION_KEY: &str = "version";

/// Current schema version written into every new document.
pub const CRDT_DOC_VERSION: i64 = 1;

/// Session metadata key holding the entity's object type.
pub const META_OBJECT_TYPE_KEY: &str = "object_type";

/// Session metadata key set on documents rebuilt from a persisted snapshot.
pub const META_FROM_PERSISTENCE_KEY: &str = "from_persistence";

/// Local-only session metadata attached to an [`EntityDoc`].
pub type DocMeta = HashMap<String, String>;

/// Summary of one committed transaction that touched the record map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCommit {
    /// Top-level field names affected by the transaction.
    pub changed_keys: Vec<String>,
    /// Origin tag of the transaction, if any.
    pub origin: Option<String>,
}

/// A CRDT document for a single entity.
pub struct EntityDoc {
    doc: Doc,
    record_map: MapRef,
    state_map: MapRef,
    meta: DocMeta,
}

impl EntityDoc {
    /// Create a new document carrying exactly the given session metadata.
    ///
    /// The state map is stamped with [`CRDT_DOC_VERSION`].
    pub fn new(meta: DocMeta) -> Self {
        Self::from_doc(Doc::new(), meta)
    }

    /// Create a new document for an object type.
    pub fn for_object_type(object_type: &str) -> Self {
        let mut meta = DocMeta::new();
        meta.insert(META_OBJECT_TYPE_KEY.to_string(), object_type.to_string());
        Self::new(meta)
    }

    fn from_doc(doc: Doc, meta: DocMeta) -> Self {
        let record_map = doc.get_or_insert_map(RECORD_MAP_NAME);
        let state_map = doc.get_or_insert_map(STATE_MAP_NAME);

        {
            let mut txn = doc.transact_mut_with(LOCAL_SYNC_MANAGER_ORIGIN);
            state_map.insert(&mut txn, STATE_VERSION_KEY, Any::BigInt(CRDT_DOC_VERSION));
        }

        Self {
            doc,
            record_map,
            state_map,
            meta,
        }
    }

    /// Get the underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Get the record map.
    pub fn record_map(&self) -> &MapRef {
        &self.record_map
    }

    /// Replica identity of this document.
    pub fn client_id(&self) -> ClientID {
        self.doc.client_id()
    }

    // ==================== Session Metadata ====================

    /// All session metadata.
    pub fn meta(&self) -> &DocMeta {
        &self.meta
    }

    /// Get a session metadata value.
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// The object type this document was created for, if recorded.
    pub fn object_type(&self) -> Option<&str> {
        self.meta_value(META_OBJECT_TYPE_KEY)
    }

    /// Whether this document was rebuilt from a persisted snapshot.
    pub fn is_from_persistence(&self) -> bool {
        self.meta_value(META_FROM_PERSISTENCE_KEY) == Some("true")
    }

    pub(crate) fn mark_from_persistence(&mut self) {
        self.meta
            .insert(META_FROM_PERSISTENCE_KEY.to_string(), "true".to_string());
    }

    /// Schema version stamp found in the state map.
    ///
    /// After merging documents created by different replicas the stamp from
    /// the winning write is returned.
    pub fn schema_version(&self) -> Option<i64> {
        let txn = self.doc.transact();
        match self.state_map.get(&txn, STATE_VERSION_KEY)? {
            Out::Any(Any::BigInt(version)) => Some(version),
            Out::Any(Any::Number(version)) => Some(version as i64),
            _ => None,
        }
    }

    // ==================== Field Access ====================

    /// Get a single field value.
    pub fn get_field(&self, key: &str) -> Option<Value> {
        let txn = self.doc.transact();
        self.record_map
            .get(&txn, key)
            .map(|value| decode_field(value.to_string(&txn)))
    }

    /// Get all synchronized fields, ordered by field name.
    pub fn fields(&self) -> ChangeSet {
        let txn = self.doc.transact();
        let sorted: BTreeMap<String, Value> = self
            .record_map
            .iter(&txn)
            .map(|(key, value)| (key.to_string(), decode_field(value.to_string(&txn))))
            .collect();
        sorted.into_iter().collect()
    }

    /// Number of synchronized fields.
    pub fn field_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.record_map.len(&txn)
    }

    /// Open a write transaction on the record map tagged with `origin`.
    ///
    /// The transaction commits when the returned handle is dropped.
    pub fn transact_record(&self, origin: &str) -> RecordTxn<'_> {
        RecordTxn {
            record_map: self.record_map.clone(),
            txn: self.doc.transact_mut_with(origin),
        }
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as a v1 update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the full state as a v2 update.
    pub fn encode_state_as_update_v2(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v2(&StateVector::default())
    }

    /// Encode the diff between current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply a v1 update inside a transaction tagged with `origin`.
    pub fn apply_update(&self, update: &[u8], origin: &str) -> Result<()> {
        let decoded = decode_update(|| Update::decode_v1(update))?;
        self.apply_decoded(decoded, origin)
    }

    /// Apply a v2 update inside a transaction tagged with `origin`.
    pub fn apply_update_v2(&self, update: &[u8], origin: &str) -> Result<()> {
        let decoded = decode_update(|| Update::decode_v2(update))?;
        self.apply_decoded(decoded, origin)
    }

    fn apply_decoded(&self, update: Update, origin: &str) -> Result<()> {
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| SyncError::Crdt(format!("Failed to apply update: {}", e)))
    }

    // ==================== Observers ====================

    /// Observe every committed transaction that touches the record map,
    /// including changes nested inside field values.
    ///
    /// Returns a subscription that unsubscribes when dropped.
    pub fn observe_record<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecordCommit) + Send + Sync + 'static,
    {
        self.record_map.observe_deep(move |txn, events| {
            let mut changed_keys: Vec<String> = Vec::new();
            for event in events.iter() {
                match event {
                    Event::Map(map_event) if map_event.path().is_empty() => {
                        changed_keys.extend(map_event.keys(txn).keys().map(|k| k.to_string()));
                    }
                    other => {
                        if let Some(PathSegment::Key(key)) = other.path().front() {
                            changed_keys.push(key.to_string());
                        }
                    }
                }
            }
            changed_keys.sort();
            changed_keys.dedup();

            callback(&RecordCommit {
                changed_keys,
                origin: txn.origin().map(origin_to_string),
            });
        })
    }

    /// Observe every update applied to the document.
    ///
    /// The callback receives the v1-encoded update and the transaction origin.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&[u8], Option<&str>) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().map(origin_to_string);
                callback(&event.update, origin.as_deref());
            })
            .map_err(|e| SyncError::Crdt(format!("Failed to observe document updates: {}", e)))
    }
}

impl std::fmt::Debug for EntityDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDoc")
            .field("client_id", &self.client_id())
            .field("meta", &self.meta)
            .field("field_count", &self.field_count())
            .finish_non_exhaustive()
    }
}

/// Write handle over an entity's record map inside one transaction.
pub struct RecordTxn<'doc> {
    record_map: MapRef,
    txn: TransactionMut<'doc>,
}

impl<'doc> RecordTxn<'doc> {
    /// Set a field to a JSON value.
    pub fn set(&mut self, key: &str, value: &Value) {
        self.record_map
            .insert(&mut self.txn, key, encode_field(value));
    }

    /// Remove a field.
    pub fn remove(&mut self, key: &str) {
        self.record_map.remove(&mut self.txn, key);
    }

    /// Read a field as seen inside this transaction.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.record_map
            .get(&self.txn, key)
            .map(|value| decode_field(value.to_string(&self.txn)))
    }

    /// The record map, for configs that store nested shared types.
    pub fn record_map(&self) -> &MapRef {
        &self.record_map
    }

    /// The underlying transaction.
    pub fn txn_mut(&mut self) -> &mut TransactionMut<'doc> {
        &mut self.txn
    }
}

fn encode_field(value: &Value) -> String {
    value.to_string()
}

/// Field values are stored as JSON text; anything that doesn't parse (a plain
/// string written by a foreign peer, say) is kept as a string.
fn decode_field(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

/// Decode an update, turning a decoder panic on malformed bytes into an error.
pub(crate) fn decode_update<E, F>(decode: F) -> Result<Update>
where
    E: std::fmt::Display,
    F: FnOnce() -> std::result::Result<Update, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(decode)) {
        Ok(Ok(update)) => Ok(update),
        Ok(Err(e)) => Err(SyncError::Crdt(format!("Failed to decode update: {}", e))),
        Err(_) => Err(SyncError::Crdt("Failed to decode update: malformed payload".to_string())),
    }
}

fn origin_to_string(origin: &Origin) -> String {
    String::from_utf8_lossy(origin.as_ref()).into_owned()
}
