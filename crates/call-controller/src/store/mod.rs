//! Shared document store.
//!
//! Every controller process reads and writes the same store. Writes are
//! versioned by `updated_at`: `replace` and `remove_if_unchanged` only apply
//! when the caller's copy is current, which is how read-modify-write cycles
//! stay correct without holding a lock.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use call_protocol::{ChangeFeed, Collection, Document, Record};
use chrono::{DateTime, Utc};
use common::types::{CallId, PeerId};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A live record with the same unique key exists.
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey { collection: Collection, key: String },

    /// No live record with this id.
    #[error("document not found in {collection}: {id}")]
    NotFound { collection: Collection, id: String },

    /// The record changed since the caller read it.
    #[error("stale write to {collection}: {id}")]
    Stale { collection: Collection, id: String },

    /// The store cannot serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Predicate over live records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    collections: Vec<Collection>,
    call: Option<CallId>,
    peer: Option<PeerId>,
}

impl Filter {
    /// Records of one collection.
    #[must_use]
    pub fn collection(collection: Collection) -> Self {
        Self {
            collections: vec![collection],
            ..Self::default()
        }
    }

    /// Records of any of the given collections.
    #[must_use]
    pub fn collections(collections: &[Collection]) -> Self {
        Self {
            collections: collections.to_vec(),
            ..Self::default()
        }
    }

    /// Restrict to one call.
    #[must_use]
    pub fn in_call(mut self, call: &CallId) -> Self {
        self.call = Some(call.clone());
        self
    }

    /// Restrict to negotiation records owned by one peer.
    #[must_use]
    pub fn for_peer(mut self, peer: &PeerId) -> Self {
        self.peer = Some(peer.clone());
        self
    }

    /// Whether a live record matches.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if !self.collections.is_empty() && !self.collections.contains(&record.collection()) {
            return false;
        }
        if let Some(call) = &self.call {
            if record.call() != Some(call) {
                return false;
            }
        }
        if let Some(peer) = &self.peer {
            if record.owning_peer() != Some(peer) {
                return false;
            }
        }
        true
    }
}

/// Shared document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new record, enforcing its collection's unique key.
    async fn insert(&self, record: Record) -> Result<Record, StoreError>;

    /// Replace a live record by id. Fails with `Stale` when the stored
    /// `updated_at` differs from the caller's copy. Bumps `updated_at`.
    async fn replace(&self, record: Record) -> Result<Record, StoreError>;

    /// Soft-delete a live record. Returns the last live value, or `None`
    /// when nothing live had this id.
    async fn remove(&self, collection: Collection, id: &str)
        -> Result<Option<Record>, StoreError>;

    /// Soft-delete only if the record is still at version `updated_at`.
    async fn remove_if_unchanged(
        &self,
        collection: Collection,
        id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Fetch one live record.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, StoreError>;

    /// All live records matching `filter`, in insertion order.
    async fn find(&self, filter: &Filter) -> Result<Vec<Record>, StoreError>;

    /// Atomic snapshot of matching records plus an ordered feed of every
    /// subsequent change to a matching record.
    async fn watch(&self, filter: Filter) -> Result<(Vec<Record>, ChangeFeed), StoreError>;
    /// Forget soft-deleted records removed before `removed_before`. Returns
    /// how many were dropped.
    async fn purge_removed(&self, removed_before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Typed helpers over [`DocumentStore`].
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn insert_doc<D: Document>(&self, doc: D) -> Result<D, StoreError> {
        let record = self.insert(doc.into_record()).await?;
        downcast(record)
    }

    async fn replace_doc<D: Document>(&self, doc: D) -> Result<D, StoreError> {
        let record = self.replace(doc.into_record()).await?;
        downcast(record)
    }

    async fn get_doc<D: Document>(&self, id: &str) -> Result<Option<D>, StoreError> {
        Ok(self.get(D::COLLECTION, id).await?.and_then(D::from_record))
    }

    async fn find_docs<D: Document>(&self, filter: Filter) -> Result<Vec<D>, StoreError> {
        let filter = Filter {
            collections: vec![D::COLLECTION],
            ..filter
        };
        Ok(self
            .find(&filter)
            .await?
            .into_iter()
            .filter_map(D::from_record)
            .collect())
    }

    async fn remove_doc<D: Document>(&self, id: &str) -> Result<Option<D>, StoreError> {
        Ok(self.remove(D::COLLECTION, id).await?.and_then(D::from_record))
    }
}

impl<T: DocumentStore + ?Sized> DocumentStoreExt for T {}

fn downcast<D: Document>(record: Record) -> Result<D, StoreError> {
    let collection = record.collection();
    let id = record.id().to_string();
    D::from_record(record).ok_or_else(|| {
        StoreError::Unavailable(format!(
            "store returned {collection} record {id} for {}",
            D::COLLECTION
        ))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use call_protocol::{DocMeta, Room};
    use common::types::{HuntId, ServerId, UserId};

    fn room(call: &str) -> Record {
        Record::Room(Room {
            meta: DocMeta::new(&UserId::from("u")),
            hunt: HuntId::from("h"),
            call: CallId::from(call),
            routed_server: ServerId::from("cc-1"),
        })
    }

    #[test]
    fn test_filter_matching() {
        let r = room("c1");
        assert!(Filter::default().matches(&r));
        assert!(Filter::collection(Collection::Rooms).matches(&r));
        assert!(!Filter::collection(Collection::Peers).matches(&r));
        assert!(Filter::collection(Collection::Rooms)
            .in_call(&CallId::from("c1"))
            .matches(&r));
        assert!(!Filter::default().in_call(&CallId::from("c2")).matches(&r));
        assert!(!Filter::default().for_peer(&PeerId::from("p")).matches(&r));
    }
}
