//! Snapshot encoding for entity documents.
//!
//! A snapshot is the document's full state as a v2 update, base64-encoded and
//! wrapped in a small JSON container so the format can grow new fields later:
//!
//! ```json
//! { "document": "AAECAwQ..." }
//! ```
//!
//! Decoding never fails loudly. A snapshot that can't be read is treated as
//! "no snapshot", because losing collaborative history is preferable to
//! blocking the editor.

use std::panic::{self, AssertUnwindSafe};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::entity_doc::{DocMeta, EntityDoc, decode_update};
use crate::types::PERSISTENCE_ORIGIN;

/// How many fresh replica ids to draw before giving up on avoiding a clash
/// with an id already present in the snapshot.
const MAX_CLIENT_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotContainer {
    document: String,
}

/// Serialize a document's full replicated state into a snapshot string.
pub fn serialize(doc: &EntityDoc) -> String {
    let container = SnapshotContainer {
        document: STANDARD.encode(doc.encode_state_as_update_v2()),
    };
    serde_json::to_string(&container).expect("snapshot container is a single string field")
}

/// Rebuild a document from a snapshot string.
///
/// The result is marked as coming from persistence and gets a replica id
/// that does not appear anywhere in the snapshot, so it can never be mistaken
/// for the live session that wrote it. Returns `None` for malformed JSON, a
/// missing `document` field, bad base64, or a payload that isn't a valid
/// update.
pub fn deserialize(serialized: &str) -> Option<EntityDoc> {
    let container: SnapshotContainer = match serde_json::from_str(serialized) {
        Ok(container) => container,
        Err(e) => {
            log::warn!("Discarding CRDT snapshot with invalid container: {}", e);
            return None;
        }
    };

    let bytes = match STANDARD.decode(container.document.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Discarding CRDT snapshot with invalid base64: {}", e);
            return None;
        }
    };

    let snapshot_clients = match snapshot_state_vector(&bytes) {
        Some(sv) => sv,
        None => {
            log::warn!("Discarding CRDT snapshot with undecodable update payload");
            return None;
        }
    };

    let mut doc = fresh_replica(&snapshot_clients);
    if let Err(e) = doc.apply_update_v2(&bytes, PERSISTENCE_ORIGIN) {
        log::warn!("Discarding CRDT snapshot that failed to apply: {}", e);
        return None;
    }
    doc.mark_from_persistence();
    Some(doc)
}

/// Decode the payload into a scratch doc and report which replicas wrote it.
///
/// yrs may panic rather than error on malformed input, so the scratch apply
/// runs under `catch_unwind`.
fn snapshot_state_vector(bytes: &[u8]) -> Option<StateVector> {
    let update = decode_update(|| Update::decode_v2(bytes)).ok()?;
    panic::catch_unwind(AssertUnwindSafe(move || {
        let scratch = Doc::new();
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(update).ok()?;
        }
        let txn = scratch.transact();
        Some(txn.state_vector())
    }))
    .ok()
    .flatten()
}

fn fresh_replica(snapshot_clients: &StateVector) -> EntityDoc {
    let mut doc = EntityDoc::new(DocMeta::new());
    for _ in 1..MAX_CLIENT_ID_ATTEMPTS {
        if snapshot_clients.get(&doc.client_id()) == 0 {
            break;
        }
        doc = EntityDoc::new(DocMeta::new());
    }
    doc
}
