//! Collaborator interfaces supplied by the host.
//!
//! The sync engine never talks to storage or to the network itself. It calls
//! back into the host through [`RecordHandlers`] for the entity record and
//! into [`ProviderFactory`] implementations for transports.
//!
//! ## Object safety
//!
//! Every trait here is used behind `dyn`, so async methods return boxed
//! futures instead of using `async fn`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::entity_doc::EntityDoc;
use crate::error::Result;
use crate::types::EntityRecord;

#[cfg(test)]
pub(crate) fn block_on_test<F: Future>(f: F) -> F::Output {
    futures_lite::future::block_on(f)
}

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read/write access to the host's copy of one entity record.
///
/// A fresh set of handlers is passed to every `load` call.
pub trait RecordHandlers: Send + Sync {
    /// Merge a partial record into the host's edited copy.
    ///
    /// Fields overwrite; a `meta` mapping in the patch is merged key by key.
    fn edit_record(&self, patch: EntityRecord);

    /// The host's latest edited copy of the record.
    fn get_edited_record(&self) -> BoxFuture<'_, EntityRecord>;

    /// Persist the edited record.
    fn save_record(&self) -> BoxFuture<'_, Result<()>>;
}

/// A live connection that moves CRDT updates between one entity document
/// and somewhere else.
pub trait Provider: Send + Sync {
    /// Tear the connection down. Called exactly once, at unload.
    fn destroy(&self);
}

/// Creates providers for newly loaded entities.
pub trait ProviderFactory: Send + Sync {
    /// Connect a provider to `doc`.
    ///
    /// Remote updates may start flowing into `doc` before the returned future
    /// resolves.
    fn create<'a>(
        &'a self,
        object_type: &'a str,
        object_id: &'a str,
        doc: Arc<EntityDoc>,
    ) -> BoxFuture<'a, Result<Box<dyn Provider>>>;
}
