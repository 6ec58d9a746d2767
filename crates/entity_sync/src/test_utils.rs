//! Test utilities for entity_sync
//!
//! This module provides shared testing infrastructure: mock host handlers, a
//! counting provider factory and a sync config that records every call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::crdt::{
    BoxFuture, EntityDoc, EntitySyncConfig, FieldSyncConfig, Provider, ProviderFactory,
    RecordHandlers, RecordTxn,
};
use crate::error::{Result, SyncError};
use crate::types::{ChangeSet, EntityRecord, SyncCapability};

/// Host record handlers backed by an in-memory record.
#[derive(Default)]
pub struct MockHandlers {
    record: Mutex<EntityRecord>,
    edits: Mutex<Vec<EntityRecord>>,
    gets: AtomicUsize,
    saves: AtomicUsize,
    fail_save: bool,
}

impl MockHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: EntityRecord) -> Self {
        Self {
            record: Mutex::new(record),
            ..Self::default()
        }
    }

    /// Handlers whose `save_record` always fails.
    pub fn failing_save() -> Self {
        Self {
            fail_save: true,
            ..Self::default()
        }
    }

    /// The host's current copy of the record.
    pub fn record(&self) -> EntityRecord {
        self.record.lock().unwrap().clone()
    }

    /// Every patch passed to `edit_record`, in order.
    pub fn edits(&self) -> Vec<EntityRecord> {
        self.edits.lock().unwrap().clone()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RecordHandlers for MockHandlers {
    fn edit_record(&self, patch: EntityRecord) {
        self.edits.lock().unwrap().push(patch.clone());
        self.record.lock().unwrap().merge(patch);
    }

    fn get_edited_record(&self) -> BoxFuture<'_, EntityRecord> {
        Box::pin(async move {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.record()
        })
    }

    fn save_record(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_save {
                return Err(SyncError::Handler("save rejected".to_string()));
            }
            Ok(())
        })
    }
}

/// Provider factory that counts creations and destructions.
#[derive(Default)]
pub struct CountingFactory {
    created: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
    fail: bool,
    yield_first: bool,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose providers never start.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// A factory that yields once before its provider is ready.
    pub fn yielding() -> Self {
        Self {
            yield_first: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

struct CountingProvider {
    destroyed: Arc<AtomicUsize>,
}

impl Provider for CountingProvider {
    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl ProviderFactory for CountingFactory {
    fn create<'a>(
        &'a self,
        object_type: &'a str,
        object_id: &'a str,
        _doc: Arc<EntityDoc>,
    ) -> BoxFuture<'a, Result<Box<dyn Provider>>> {
        Box::pin(async move {
            self.created.fetch_add(1, Ordering::SeqCst);
            if self.yield_first {
                futures_lite::future::yield_now().await;
            }
            if self.fail {
                return Err(SyncError::provider(
                    format!("{}_{}", object_type, object_id),
                    "connection refused",
                ));
            }
            Ok(Box::new(CountingProvider {
                destroyed: Arc::clone(&self.destroyed),
            }) as Box<dyn Provider>)
        })
    }
}

/// [`FieldSyncConfig`] wrapper that records every call.
pub struct RecordingConfig {
    inner: FieldSyncConfig,
    applied: Mutex<Vec<ChangeSet>>,
    /// For each apply call, the value each changed field had beforehand.
    seen_before: Mutex<Vec<ChangeSet>>,
}

impl RecordingConfig {
    pub fn new() -> Self {
        Self::wrapping(FieldSyncConfig::new())
    }

    /// A config declaring snapshot persistence support.
    pub fn persisted() -> Self {
        Self::wrapping(FieldSyncConfig::new().with_capability(SyncCapability::CrdtPersistence))
    }

    fn wrapping(inner: FieldSyncConfig) -> Self {
        Self {
            inner,
            applied: Mutex::new(Vec::new()),
            seen_before: Mutex::new(Vec::new()),
        }
    }

    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn applied(&self) -> Vec<ChangeSet> {
        self.applied.lock().unwrap().clone()
    }

    pub fn seen_before(&self) -> Vec<ChangeSet> {
        self.seen_before.lock().unwrap().clone()
    }
}

impl EntitySyncConfig for RecordingConfig {
    fn apply_changes_to_crdt_doc(&self, txn: &mut RecordTxn<'_>, changes: &ChangeSet) {
        let before: ChangeSet = changes
            .keys()
            .map(|key| (key.clone(), txn.get(key).unwrap_or(Value::Null)))
            .collect();
        self.seen_before.lock().unwrap().push(before);
        self.applied.lock().unwrap().push(changes.clone());
        self.inner.apply_changes_to_crdt_doc(txn, changes);
    }

    fn get_changes_from_crdt_doc(&self, doc: &EntityDoc, record: &EntityRecord) -> ChangeSet {
        self.inner.get_changes_from_crdt_doc(doc, record)
    }

    fn supports(&self, capability: SyncCapability) -> bool {
        self.inner.supports(capability)
    }
}
