//! Per-entity synchronization lifecycle.
//!
//! [`SyncManager`] owns one CRDT document per loaded entity and keeps it in
//! step with the host's own copy of the record.
//!
//! # Data flow
//!
//! - Host edits go into the document through [`SyncManager::update`].
//! - Everything else that lands in the document (remote peers, undo/redo, a
//!   persisted snapshot merge) is picked up by an observer, which queues the
//!   entity. [`SyncManager::process_pending`] then diffs the document against
//!   the host's latest record and hands back only the fields that differ.
//!
//! # Usage
//!
//! ```ignore
//! let relay: Arc<dyn ProviderFactory> = Arc::new(MemoryRelay::new());
//! let manager = SyncManager::new(vec![relay]);
//!
//! manager.load(config, "post", "123", record, handlers).await?;
//! manager.update("post", "123", &changes, LOCAL_EDITOR_ORIGIN);
//!
//! // Later, after remote activity:
//! manager.process_pending().await;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::join_all;
use yrs::Subscription;

use super::entity_doc::EntityDoc;
use super::handlers::{Provider, ProviderFactory, RecordHandlers};
use super::persistence;
use super::sync_config::EntitySyncConfig;
use super::undo::MultiDocUndoManager;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::types::{
    ChangeSet, EntityKey, EntityRecord, LOCAL_SYNC_MANAGER_ORIGIN, MetaPatch, SyncCapability,
};

/// Lifecycle phase of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
    Unloaded,
    /// Providers are starting or persistence is being reconciled.
    Loading,
    Loaded,
}

/// Live state of one loaded entity.
struct EntityState {
    doc: Arc<EntityDoc>,
    config: Arc<dyn EntitySyncConfig>,
    handlers: Arc<dyn RecordHandlers>,
    providers: Mutex<Vec<Box<dyn Provider>>>,
    observer: Mutex<Option<Subscription>>,
    phase: Mutex<EntityPhase>,
}

impl EntityState {
    fn new(
        doc: Arc<EntityDoc>,
        config: Arc<dyn EntitySyncConfig>,
        handlers: Arc<dyn RecordHandlers>,
    ) -> Self {
        Self {
            doc,
            config,
            handlers,
            providers: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            phase: Mutex::new(EntityPhase::Loading),
        }
    }

    /// Apply changes through the entity's config in one transaction.
    fn write(&self, origin: &str, changes: &ChangeSet) {
        let mut txn = self.doc.transact_record(origin);
        self.config.apply_changes_to_crdt_doc(&mut txn, changes);
    }

    fn teardown(&self) {
        for provider in self.providers.lock().unwrap().drain(..) {
            provider.destroy();
        }
        self.observer.lock().unwrap().take();
    }
}

/// Synchronization manager for content entities.
pub struct SyncManager {
    config: EngineConfig,
    factories: Vec<Arc<dyn ProviderFactory>>,
    states: RwLock<HashMap<EntityKey, Arc<EntityState>>>,
    undo_manager: Arc<MultiDocUndoManager>,
    /// Entities whose document changed outside of [`SyncManager::update`].
    pending: Arc<Mutex<VecDeque<EntityKey>>>,
}

impl SyncManager {
    /// Create a manager with default settings.
    ///
    /// With no factories, every operation is a no-op.
    pub fn new(factories: Vec<Arc<dyn ProviderFactory>>) -> Self {
        Self::with_config(EngineConfig::default(), factories)
    }

    /// Create a manager with explicit settings.
    pub fn with_config(config: EngineConfig, factories: Vec<Arc<dyn ProviderFactory>>) -> Self {
        let undo_manager = Arc::new(MultiDocUndoManager::new(&config));
        Self {
            config,
            factories,
            states: RwLock::new(HashMap::new()),
            undo_manager,
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The undo coordinator shared by every loaded entity.
    pub fn undo_manager(&self) -> Arc<MultiDocUndoManager> {
        Arc::clone(&self.undo_manager)
    }

    fn state(&self, key: &EntityKey) -> Option<Arc<EntityState>> {
        self.states.read().unwrap().get(key).cloned()
    }

    /// Whether `state` is still the registered state for `key`.
    fn is_current(&self, key: &EntityKey, state: &Arc<EntityState>) -> bool {
        self.states
            .read()
            .unwrap()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, state))
    }

    // ==================== Lifecycle ====================

    /// Start synchronizing an entity.
    ///
    /// Creates the entity's document, connects every provider, attaches the
    /// change observer and reconciles any persisted snapshot in `record`.
    /// Loading an entity that is already loaded (or loading) does nothing.
    ///
    /// Returns an error if a provider fails to start, in which case the
    /// entity is left unloaded, or if saving the refreshed snapshot fails.
    pub async fn load(
        &self,
        sync_config: Arc<dyn EntitySyncConfig>,
        object_type: &str,
        object_id: &str,
        record: EntityRecord,
        handlers: Arc<dyn RecordHandlers>,
    ) -> Result<()> {
        if self.factories.is_empty() {
            log::debug!("[SyncManager] No providers registered, skipping load");
            return Ok(());
        }

        let key = EntityKey::new(object_type, object_id);
        let state = {
            let mut states = self.states.write().unwrap();
            if states.contains_key(&key) {
                log::debug!("[SyncManager] {} already loaded", key);
                return Ok(());
            }

            let doc = Arc::new(EntityDoc::for_object_type(object_type));
            self.undo_manager.add_to_scope(&key, &doc);
            let state = Arc::new(EntityState::new(doc, sync_config, handlers));
            states.insert(key.clone(), Arc::clone(&state));
            state
        };
        log::debug!("[SyncManager] Loading {}", key);

        let providers = match self.start_providers(object_type, object_id, &state).await {
            Ok(providers) => providers,
            Err(e) => {
                log::warn!("[SyncManager] Provider failed for {}: {}", key, e);
                self.discard(&key, &state);
                return Err(e);
            }
        };

        if !self.is_current(&key, &state) {
            log::debug!("[SyncManager] {} was unloaded while loading", key);
            for provider in providers {
                provider.destroy();
            }
            return Ok(());
        }
        *state.providers.lock().unwrap() = providers;

        self.attach_observer(&key, &state);
        let reconciled = self.reconcile(&key, &state, &record).await;

        // The document is correct even if saving failed; a later save can
        // persist it.
        if self.is_current(&key, &state) {
            *state.phase.lock().unwrap() = EntityPhase::Loaded;
            log::debug!("[SyncManager] Loaded {}", key);
        }
        reconciled
    }

    /// Run every factory concurrently. On failure, providers that did start
    /// are destroyed and the first error is returned.
    async fn start_providers(
        &self,
        object_type: &str,
        object_id: &str,
        state: &EntityState,
    ) -> Result<Vec<Box<dyn Provider>>> {
        let results = join_all(
            self.factories
                .iter()
                .map(|factory| factory.create(object_type, object_id, Arc::clone(&state.doc))),
        )
        .await;

        let mut providers = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(provider) => providers.push(provider),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(providers),
            Some(e) => {
                for provider in providers {
                    provider.destroy();
                }
                Err(e)
            }
        }
    }

    /// Remove a state that failed to load, unless it was already replaced.
    fn discard(&self, key: &EntityKey, state: &Arc<EntityState>) {
        let mut states = self.states.write().unwrap();
        if states
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, state))
        {
            states.remove(key);
            drop(states);
            self.undo_manager.remove_from_scope(key);
        }
    }

    fn attach_observer(&self, key: &EntityKey, state: &EntityState) {
        let pending = Arc::clone(&self.pending);
        let local_origin = self.config.local_editor_origin.clone();
        let observed = key.clone();

        let subscription = state.doc.observe_record(move |commit| {
            // Already reflected in the host's own state
            let origin = commit.origin.as_deref();
            if origin == Some(local_origin.as_str()) || origin == Some(LOCAL_SYNC_MANAGER_ORIGIN) {
                return;
            }
            pending.lock().unwrap().push_back(observed.clone());
        });

        *state.observer.lock().unwrap() = Some(subscription);
    }

    /// Merge a persisted snapshot, or seed the document from the record.
    async fn reconcile(
        &self,
        key: &EntityKey,
        state: &EntityState,
        record: &EntityRecord,
    ) -> Result<()> {
        let persists = state.config.supports(SyncCapability::CrdtPersistence);

        if persists {
            let status = persistence::apply_persisted(&state.doc, record, state.config.as_ref());
            if status.is_valid() {
                log::debug!("[SyncManager] Reused persisted snapshot for {}", key);
                return Ok(());
            }
        }

        state.write(LOCAL_SYNC_MANAGER_ORIGIN, &record.fields);

        if persists {
            let mut meta = record.meta.clone().unwrap_or_default();
            meta.extend(persistence::write_persisted(&state.doc));
            state.handlers.edit_record(EntityRecord::from_meta(meta));
            state.handlers.save_record().await?;
            log::debug!("[SyncManager] Saved fresh snapshot for {}", key);
        }
        Ok(())
    }

    /// Stop synchronizing an entity.
    ///
    /// Destroys its providers, detaches the observer, drops the document and
    /// forgets its undo history. Unknown entities are ignored.
    pub fn unload(&self, object_type: &str, object_id: &str) {
        let key = EntityKey::new(object_type, object_id);
        self.unload_key(&key);
    }

    fn unload_key(&self, key: &EntityKey) {
        let Some(state) = self.states.write().unwrap().remove(key) else {
            return;
        };
        state.teardown();
        self.undo_manager.remove_from_scope(key);
        self.pending.lock().unwrap().retain(|k| k != key);
        log::debug!("[SyncManager] Unloaded {}", key);
    }

    /// Unload every entity.
    pub fn unload_all(&self) {
        let keys: Vec<EntityKey> = self.states.read().unwrap().keys().cloned().collect();
        for key in keys {
            self.unload_key(&key);
        }
    }

    // ==================== Edits ====================

    /// Apply host edits to an entity's document in one transaction tagged
    /// with `origin`. Does nothing if the entity isn't loaded.
    pub fn update(&self, object_type: &str, object_id: &str, changes: &ChangeSet, origin: &str) {
        let key = EntityKey::new(object_type, object_id);
        let Some(state) = self.state(&key) else {
            return;
        };
        log::debug!("[SyncManager] Update {} ({} fields, origin {})", key, changes.len(), origin);
        state.write(origin, changes);
    }

    /// The `meta` patch that persists an entity's current document.
    ///
    /// Empty unless the entity is loaded and its config supports
    /// persistence.
    pub fn create_meta(&self, object_type: &str, object_id: &str) -> MetaPatch {
        let key = EntityKey::new(object_type, object_id);
        match self.state(&key) {
            Some(state) if state.config.supports(SyncCapability::CrdtPersistence) => {
                persistence::write_persisted(&state.doc)
            }
            _ => MetaPatch::new(),
        }
    }

    // ==================== Pulling Changes ====================

    /// Whether any entity is waiting for its changes to be pulled.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    /// Pull document changes into the host record for every queued entity.
    ///
    /// Returns how many entities had a non-empty change set delivered.
    pub async fn process_pending(&self) -> usize {
        let keys: Vec<EntityKey> = {
            let mut pending = self.pending.lock().unwrap();
            let mut seen = HashSet::new();
            pending.drain(..).filter(|k| seen.insert(k.clone())).collect()
        };

        let mut delivered = 0;
        for key in keys {
            let Some(state) = self.state(&key) else {
                continue;
            };
            if self.pull_changes(&key, &state).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn pull_changes(&self, key: &EntityKey, state: &Arc<EntityState>) -> bool {
        let record = state.handlers.get_edited_record().await;

        // The record getter may have yielded to an unload
        if !self.is_current(key, state) {
            return false;
        }

        let changes = state.config.get_changes_from_crdt_doc(&state.doc, &record);
        if changes.is_empty() {
            return false;
        }

        log::debug!(
            "[SyncManager] Pulling {} changed fields into {}",
            changes.len(),
            key
        );
        state.handlers.edit_record(EntityRecord::from_changes(changes));
        true
    }

    // ==================== Introspection ====================

    /// Current lifecycle phase of an entity.
    pub fn entity_phase(&self, object_type: &str, object_id: &str) -> EntityPhase {
        let key = EntityKey::new(object_type, object_id);
        match self.state(&key) {
            Some(state) => *state.phase.lock().unwrap(),
            None => EntityPhase::Unloaded,
        }
    }

    /// Whether an entity has finished loading.
    pub fn is_loaded(&self, object_type: &str, object_id: &str) -> bool {
        self.entity_phase(object_type, object_id) == EntityPhase::Loaded
    }

    /// Keys of every entity with live state, sorted.
    pub fn loaded_entities(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.states.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The document of a loaded entity.
    pub fn doc(&self, object_type: &str, object_id: &str) -> Option<Arc<EntityDoc>> {
        let key = EntityKey::new(object_type, object_id);
        self.state(&key).map(|state| Arc::clone(&state.doc))
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.unload_all();
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("config", &self.config)
            .field("factories", &self.factories.len())
            .field("loaded", &self.loaded_entities())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::block_on_test;
    use crate::test_utils::{CountingFactory, MockHandlers, RecordingConfig};
    use crate::types::LOCAL_EDITOR_ORIGIN;
    use serde_json::json;

    fn manager_with(factory: &Arc<CountingFactory>) -> SyncManager {
        let factory: Arc<dyn ProviderFactory> = factory.clone();
        SyncManager::new(vec![factory])
    }

    fn load(
        manager: &SyncManager,
        config: &Arc<RecordingConfig>,
        id: &str,
        handlers: &Arc<MockHandlers>,
    ) -> Result<()> {
        let record = handlers.record();
        block_on_test(manager.load(config.clone(), "post", id, record, handlers.clone()))
    }

    #[test]
    fn test_phases() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(&factory);
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::with_record(
            EntityRecord::new().with_field("title", "Test Post"),
        ));

        assert_eq!(manager.entity_phase("post", "1"), EntityPhase::Unloaded);
        load(&manager, &config, "1", &handlers).unwrap();
        assert_eq!(manager.entity_phase("post", "1"), EntityPhase::Loaded);
        assert!(manager.is_loaded("post", "1"));
        assert_eq!(manager.loaded_entities(), vec![EntityKey::new("post", "1")]);

        manager.unload("post", "1");
        assert_eq!(manager.entity_phase("post", "1"), EntityPhase::Unloaded);
        assert!(manager.doc("post", "1").is_none());
    }

    #[test]
    fn test_provider_failure_leaves_entity_unloaded() {
        let good = Arc::new(CountingFactory::new());
        let bad = Arc::new(CountingFactory::failing());
        let factories: Vec<Arc<dyn ProviderFactory>> = vec![good.clone(), bad.clone()];
        let manager = SyncManager::new(factories);
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::new());

        let result = load(&manager, &config, "1", &handlers);

        assert!(result.is_err());
        assert_eq!(manager.entity_phase("post", "1"), EntityPhase::Unloaded);
        assert_eq!(good.destroyed(), 1);
        assert_eq!(config.apply_count(), 0);
        assert!(!manager.undo_manager().is_in_scope(&EntityKey::new("post", "1")));

        // A later attempt starts from scratch.
        let factories: Vec<Arc<dyn ProviderFactory>> = vec![good.clone()];
        let retry = SyncManager::new(factories);
        load(&retry, &config, "1", &handlers).unwrap();
        assert!(retry.is_loaded("post", "1"));
    }

    #[test]
    fn test_unload_during_load_discards_providers() {
        let factory = Arc::new(CountingFactory::yielding());
        let manager = manager_with(&factory);
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::new());

        let (result, ()) = block_on_test(futures_lite::future::zip(
            manager.load(config.clone(), "post", "1", EntityRecord::new(), handlers.clone()),
            async {
                assert_eq!(manager.entity_phase("post", "1"), EntityPhase::Loading);
                manager.unload("post", "1");
            },
        ));

        assert!(result.is_ok());
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.destroyed(), 1);
        assert_eq!(config.apply_count(), 0);
        assert_eq!(manager.entity_phase("post", "1"), EntityPhase::Unloaded);
    }

    #[test]
    fn test_save_failure_is_returned_but_entity_stays_loaded() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(&factory);
        let config = Arc::new(RecordingConfig::persisted());
        let handlers = Arc::new(MockHandlers::failing_save());

        assert!(load(&manager, &config, "1", &handlers).is_err());
        assert!(manager.is_loaded("post", "1"));
        assert!(!manager.create_meta("post", "1").is_empty());
    }

    #[test]
    fn test_create_meta() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(&factory);
        let handlers = Arc::new(MockHandlers::with_record(
            EntityRecord::new().with_field("title", "Test Post"),
        ));

        assert!(manager.create_meta("post", "1").is_empty());

        let plain = Arc::new(RecordingConfig::new());
        load(&manager, &plain, "1", &handlers).unwrap();
        assert!(manager.create_meta("post", "1").is_empty());

        let persisted = Arc::new(RecordingConfig::persisted());
        load(&manager, &persisted, "2", &handlers).unwrap();
        let meta = manager.create_meta("post", "2");
        assert!(meta.contains_key(persistence::CRDT_DOC_META_PERSISTENCE_KEY));
    }

    #[test]
    fn test_pull_skips_entities_unloaded_before_processing() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(&factory);
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::new());
        load(&manager, &config, "1", &handlers).unwrap();

        let doc = manager.doc("post", "1").unwrap();
        doc.transact_record("remote").set("title", &json!("Remote"));
        assert!(manager.has_pending());

        manager.unload("post", "1");
        assert!(!manager.has_pending());
        assert_eq!(block_on_test(manager.process_pending()), 0);
        assert!(handlers.edits().is_empty());
    }

    #[test]
    fn test_pending_keys_are_deduplicated() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(&factory);
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::new());
        load(&manager, &config, "1", &handlers).unwrap();

        let doc = manager.doc("post", "1").unwrap();
        doc.transact_record("remote").set("title", &json!("One"));
        doc.transact_record("remote").set("title", &json!("Two"));

        assert_eq!(block_on_test(manager.process_pending()), 1);
        assert_eq!(handlers.get_count(), 1);
        assert_eq!(handlers.record().get("title"), Some(&json!("Two")));
    }

    #[test]
    fn test_custom_local_editor_origin() {
        let factory: Arc<dyn ProviderFactory> = Arc::new(CountingFactory::new());
        let manager = SyncManager::with_config(
            EngineConfig::default().with_local_editor_origin("my-editor"),
            vec![factory],
        );
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::new());
        load(&manager, &config, "1", &handlers).unwrap();

        let doc = manager.doc("post", "1").unwrap();
        doc.transact_record("my-editor").set("title", &json!("Mine"));
        assert!(!manager.has_pending());

        // The default tag is just another origin here.
        doc.transact_record(LOCAL_EDITOR_ORIGIN).set("title", &json!("Other"));
        assert!(manager.has_pending());
    }

    #[test]
    fn test_drop_destroys_providers() {
        let factory = Arc::new(CountingFactory::new());
        let config = Arc::new(RecordingConfig::new());
        let handlers = Arc::new(MockHandlers::new());
        {
            let manager = manager_with(&factory);
            load(&manager, &config, "1", &handlers).unwrap();
            load(&manager, &config, "2", &handlers).unwrap();
        }
        assert_eq!(factory.destroyed(), 2);
    }
}
