//! Core types shared across the sync engine.
//!
//! This module defines how entities are identified, the shape of entity
//! records handed to and received from the host, and the origin tags used to
//! tell local edits apart from everything else.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Origin tag used by default for edits made in the host editor.
pub const LOCAL_EDITOR_ORIGIN: &str = "local-editor";

/// Origin tag for transactions the sync manager performs on its own behalf
/// (seeding a document from the host record during load).
pub const LOCAL_SYNC_MANAGER_ORIGIN: &str = "sync-manager";

/// Origin tag for updates merged in from a persisted snapshot.
pub const PERSISTENCE_ORIGIN: &str = "persistence";

/// Separator between object type and object id in an [`EntityKey`].
pub const ENTITY_KEY_SEPARATOR: &str = "_";

/// Field name → new value. Used both for edits flowing into a CRDT document
/// and for differences flowing back out of one.
pub type ChangeSet = IndexMap<String, Value>;

/// Patch merged into an entity's `meta` mapping by the host.
pub type MetaPatch = IndexMap<String, String>;

/// In-process identifier of a loaded entity.
///
/// Composed as `object_type + "_" + object_id`. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(String);

impl EntityKey {
    /// Compose the key for an `(object_type, object_id)` pair.
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self(format!("{}{}{}", object_type, ENTITY_KEY_SEPARATOR, object_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host entity record: a flat bag of fields plus an optional `meta`
/// mapping.
///
/// The sync engine owns one reserved key inside `meta` (the persisted CRDT
/// snapshot); everything else is opaque to it. Serializes flat, with `meta`
/// alongside the other fields:
///
/// ```json
/// { "title": "Hello", "status": "draft", "meta": { "_crdt_document": "..." } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// String-valued metadata, including the persisted snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaPatch>,

    /// Every other field of the record.
    #[serde(flatten)]
    pub fields: ChangeSet,
}

impl EntityRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a partial record carrying only field changes.
    pub fn from_changes(changes: ChangeSet) -> Self {
        Self {
            meta: None,
            fields: changes,
        }
    }

    /// Create a partial record carrying only a `meta` mapping.
    pub fn from_meta(meta: MetaPatch) -> Self {
        Self {
            meta: Some(meta),
            fields: ChangeSet::new(),
        }
    }

    /// Set a field (builder pattern).
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Set a meta entry (builder pattern).
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta
            .get_or_insert_with(MetaPatch::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// Get a field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a meta value.
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key).map(String::as_str)
    }

    /// Merge a partial record into this one: fields overwrite, meta entries
    /// overwrite individually.
    pub fn merge(&mut self, patch: EntityRecord) {
        self.fields.extend(patch.fields);
        if let Some(meta) = patch.meta {
            self.meta.get_or_insert_with(MetaPatch::new).extend(meta);
        }
    }
}

/// Optional capabilities an entity type can declare in its sync config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncCapability {
    /// The entity stores a CRDT snapshot in its `meta` and can reuse it on load.
    CrdtPersistence,
}

impl std::fmt::Display for SyncCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCapability::CrdtPersistence => write!(f, "crdtPersistence"),
        }
    }
}

impl std::str::FromStr for SyncCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crdtPersistence" => Ok(SyncCapability::CrdtPersistence),
            _ => Err(format!("Unknown sync capability: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_key_composition() {
        let key = EntityKey::new("post", "123");
        assert_eq!(key.as_str(), "post_123");
        assert_eq!(key.to_string(), "post_123");
        assert_ne!(key, EntityKey::new("page", "123"));
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = EntityRecord::new()
            .with_field("title", "Hello")
            .with_meta("_crdt_document", "{}");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({ "title": "Hello", "meta": { "_crdt_document": "{}" } })
        );

        let parsed: EntityRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_without_meta() {
        let parsed: EntityRecord = serde_json::from_value(json!({ "title": "x" })).unwrap();
        assert!(parsed.meta.is_none());
        assert_eq!(parsed.get("title"), Some(&json!("x")));
        assert_eq!(parsed.meta_value("anything"), None);
    }

    #[test]
    fn test_merge_patch() {
        let mut record = EntityRecord::new()
            .with_field("title", "Old")
            .with_field("status", "draft")
            .with_meta("keep", "1");

        record.merge(
            EntityRecord::new()
                .with_field("title", "New")
                .with_meta("added", "2"),
        );

        assert_eq!(record.get("title"), Some(&json!("New")));
        assert_eq!(record.get("status"), Some(&json!("draft")));
        assert_eq!(record.meta_value("keep"), Some("1"));
        assert_eq!(record.meta_value("added"), Some("2"));
    }

    #[test]
    fn test_capability_display_and_parse() {
        assert_eq!(SyncCapability::CrdtPersistence.to_string(), "crdtPersistence");
        assert_eq!(
            "crdtPersistence".parse::<SyncCapability>().unwrap(),
            SyncCapability::CrdtPersistence
        );
        assert!("offline".parse::<SyncCapability>().is_err());
    }
}
