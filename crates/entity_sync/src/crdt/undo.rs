//! Undo/redo across many entity documents.
//!
//! Each loaded entity gets its own yrs [`UndoManager`] scoped to its record
//! map and tracking only the local editor origin. [`MultiDocUndoManager`]
//! keeps one shared stack of entity keys on top of those, so the host sees a
//! single linear history no matter which entity an edit landed in.
//!
//! Undo and redo only perform the CRDT-level transaction. The resulting field
//! changes reach the host through the sync manager's observer like any other
//! non-local commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use yrs::Subscription;
use yrs::undo::{EventKind, Options, UndoManager};

use super::entity_doc::EntityDoc;
use crate::config::EngineConfig;
use crate::types::{ChangeSet, EntityKey};

/// Field-level changes produced by an undo or redo step.
pub type HistoryRecords = Vec<ChangeSet>;

/// Uniform history contract the host drives its undo UI through.
pub trait UndoHistory: Send + Sync {
    /// Record a change made outside the CRDT.
    fn add_record(&self, record: &ChangeSet);

    /// Undo the most recent step. `None` when there is nothing to undo.
    fn undo(&self) -> Option<HistoryRecords>;

    /// Redo the most recently undone step. `None` when there is nothing to redo.
    fn redo(&self) -> Option<HistoryRecords>;

    fn has_undo(&self) -> bool;

    fn has_redo(&self) -> bool;
}

struct ScopedManager {
    manager: UndoManager<()>,
    _on_item_added: Subscription,
}

#[derive(Default)]
struct Stacks {
    undo: Vec<EntityKey>,
    redo: Vec<EntityKey>,
}

/// Undo coordinator spanning every loaded entity document.
pub struct MultiDocUndoManager {
    local_editor_origin: String,
    capture_timeout_millis: u64,
    scopes: Mutex<HashMap<EntityKey, ScopedManager>>,
    stacks: Arc<Mutex<Stacks>>,
    /// Set while an undo or redo is running, so the steps it records don't
    /// clear the redo stack.
    performing: Arc<AtomicBool>,
}

impl MultiDocUndoManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            local_editor_origin: config.local_editor_origin.clone(),
            capture_timeout_millis: config.undo_capture_timeout_ms,
            scopes: Mutex::new(HashMap::new()),
            stacks: Arc::new(Mutex::new(Stacks::default())),
            performing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start tracking local edits to an entity's record map.
    ///
    /// Calling this again for a key that is already in scope does nothing.
    pub fn add_to_scope(&self, key: &EntityKey, doc: &EntityDoc) {
        let mut scopes = self.scopes.lock().unwrap();
        if scopes.contains_key(key) {
            return;
        }

        let options = Options {
            capture_timeout_millis: self.capture_timeout_millis,
            ..Options::default()
        };
        let mut manager = UndoManager::with_scope_and_options(doc.doc(), doc.record_map(), options);
        manager.include_origin(self.local_editor_origin.as_str());

        let stacks = Arc::clone(&self.stacks);
        let performing = Arc::clone(&self.performing);
        let scope_key = key.clone();
        let on_item_added = manager.observe_item_added(move |_txn, event| {
            let mut stacks = stacks.lock().unwrap();
            // yrs tags items pushed onto its undo stack (fresh edits and
            // redos) as `Redo`, and items pushed onto its redo stack as `Undo`.
            match event.kind() {
                EventKind::Redo => {
                    stacks.undo.push(scope_key.clone());
                    if !performing.load(Ordering::SeqCst) {
                        stacks.redo.clear();
                    }
                }
                EventKind::Undo => stacks.redo.push(scope_key.clone()),
            }
        });

        log::debug!("[UndoManager] Added {} to scope", key);
        scopes.insert(
            key.clone(),
            ScopedManager {
                manager,
                _on_item_added: on_item_added,
            },
        );
    }

    /// Stop tracking an entity and forget its history.
    pub fn remove_from_scope(&self, key: &EntityKey) {
        if self.scopes.lock().unwrap().remove(key).is_none() {
            return;
        }
        let mut stacks = self.stacks.lock().unwrap();
        stacks.undo.retain(|k| k != key);
        stacks.redo.retain(|k| k != key);
        log::debug!("[UndoManager] Removed {} from scope", key);
    }

    /// Whether an entity is currently tracked.
    pub fn is_in_scope(&self, key: &EntityKey) -> bool {
        self.scopes.lock().unwrap().contains_key(key)
    }

    fn perform(&self, redo: bool) -> Option<HistoryRecords> {
        loop {
            let key = {
                let mut stacks = self.stacks.lock().unwrap();
                let stack = if redo { &mut stacks.redo } else { &mut stacks.undo };
                stack.pop()?
            };

            let mut scopes = self.scopes.lock().unwrap();
            let Some(scoped) = scopes.get_mut(&key) else {
                continue;
            };

            self.performing.store(true, Ordering::SeqCst);
            let applied = if redo {
                scoped.manager.redo_blocking()
            } else {
                scoped.manager.undo_blocking()
            };
            self.performing.store(false, Ordering::SeqCst);

            if applied {
                log::debug!(
                    "[UndoManager] {} applied to {}",
                    if redo { "Redo" } else { "Undo" },
                    key
                );
                return Some(HistoryRecords::new());
            }
        }
    }
}

impl UndoHistory for MultiDocUndoManager {
    /// History comes from observing CRDT commits; nothing to record here.
    fn add_record(&self, _record: &ChangeSet) {}

    fn undo(&self) -> Option<HistoryRecords> {
        self.perform(false)
    }

    fn redo(&self) -> Option<HistoryRecords> {
        self.perform(true)
    }

    fn has_undo(&self) -> bool {
        !self.stacks.lock().unwrap().undo.is_empty()
    }

    fn has_redo(&self) -> bool {
        !self.stacks.lock().unwrap().redo.is_empty()
    }
}

impl std::fmt::Debug for MultiDocUndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stacks = self.stacks.lock().unwrap();
        f.debug_struct("MultiDocUndoManager")
            .field("local_editor_origin", &self.local_editor_origin)
            .field("undo_depth", &stacks.undo.len())
            .field("redo_depth", &stacks.redo.len())
            .finish_non_exhaustive()
    }
}
