//! In-process provider linking documents of the same entity.
//!
//! This provides a simple [`ProviderFactory`] that connects every document
//! loaded for the same `(object_type, object_id)` through shared memory, for
//! use in tests and single-process hosts. A newly connected document first
//! exchanges full state with the documents already connected, then every
//! update it commits is forwarded to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use yrs::Subscription;

use super::entity_doc::EntityDoc;
use super::handlers::{BoxFuture, Provider, ProviderFactory};
use crate::error::{Result, SyncError};
use crate::types::EntityKey;

/// Origin tag for updates delivered by the relay.
pub const RELAY_ORIGIN: &str = "memory-relay";

type PeerMap = HashMap<EntityKey, Vec<Peer>>;

struct Peer {
    id: u64,
    doc: Weak<EntityDoc>,
}

/// In-memory relay between documents of the same entity.
///
/// Cloning yields a handle to the same relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    peers: Arc<RwLock<PeerMap>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryRelay {
    /// Create a new relay with no connected documents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live documents connected for an entity.
    pub fn peer_count(&self, object_type: &str, object_id: &str) -> usize {
        let peers = self.peers.read().unwrap();
        peers
            .get(&EntityKey::new(object_type, object_id))
            .map(|list| list.iter().filter(|p| p.doc.strong_count() > 0).count())
            .unwrap_or(0)
    }

    fn connect(&self, key: EntityKey, doc: Arc<EntityDoc>) -> Result<RelayConnection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let existing = live_peers(&self.peers.read().unwrap(), &key, id);
        for peer in &existing {
            doc.apply_update(&peer.encode_state_as_update(), RELAY_ORIGIN)?;
            peer.apply_update(&doc.encode_state_as_update(), RELAY_ORIGIN)?;
        }

        let peers = Arc::clone(&self.peers);
        let forward_key = key.clone();
        let subscription = doc.observe_updates(move |update, origin| {
            if origin == Some(RELAY_ORIGIN) {
                return;
            }
            let targets = live_peers(&peers.read().unwrap(), &forward_key, id);
            for target in targets {
                if let Err(e) = target.apply_update(update, RELAY_ORIGIN) {
                    log::warn!("[MemoryRelay] Failed to forward update for {}: {}", forward_key, e);
                }
            }
        })?;

        self.peers
            .write()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(Peer {
                id,
                doc: Arc::downgrade(&doc),
            });

        log::debug!(
            "[MemoryRelay] Connected {} (peer {}, {} existing)",
            key,
            id,
            existing.len()
        );

        Ok(RelayConnection {
            peers: Arc::clone(&self.peers),
            key,
            id,
            subscription: Mutex::new(Some(subscription)),
        })
    }
}

impl ProviderFactory for MemoryRelay {
    fn create<'a>(
        &'a self,
        object_type: &'a str,
        object_id: &'a str,
        doc: Arc<EntityDoc>,
    ) -> BoxFuture<'a, Result<Box<dyn Provider>>> {
        Box::pin(async move {
            let key = EntityKey::new(object_type, object_id);
            let connection = self
                .connect(key.clone(), doc)
                .map_err(|e| SyncError::provider(key.as_str(), e.to_string()))?;
            Ok(Box::new(connection) as Box<dyn Provider>)
        })
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.read().unwrap();
        f.debug_struct("MemoryRelay")
            .field("entities", &peers.len())
            .finish()
    }
}

/// Upgrade every live peer of `key` other than `exclude`.
fn live_peers(peers: &PeerMap, key: &EntityKey, exclude: u64) -> Vec<Arc<EntityDoc>> {
    peers
        .get(key)
        .map(|list| {
            list.iter()
                .filter(|p| p.id != exclude)
                .filter_map(|p| p.doc.upgrade())
                .collect()
        })
        .unwrap_or_default()
}

/// One document's connection to a [`MemoryRelay`].
pub struct RelayConnection {
    peers: Arc<RwLock<PeerMap>>,
    key: EntityKey,
    id: u64,
    subscription: Mutex<Option<Subscription>>,
}

impl Provider for RelayConnection {
    fn destroy(&self) {
        self.subscription.lock().unwrap().take();

        let mut peers = self.peers.write().unwrap();
        if let Some(list) = peers.get_mut(&self.key) {
            list.retain(|p| p.id != self.id);
            if list.is_empty() {
                peers.remove(&self.key);
            }
        }
        log::debug!("[MemoryRelay] Disconnected {} (peer {})", self.key, self.id);
    }
}
