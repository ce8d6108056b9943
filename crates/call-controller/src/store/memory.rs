//! In-memory document store.
//!
//! One instance can be shared by several controller processes running in the
//! same address space. Changes are published to watchers while the state
//! mutex is held, so every watcher sees changes in store order and a watch
//! snapshot never misses or duplicates a change.

use super::{DocumentStore, Filter, StoreError};
use async_trait::async_trait;
use call_protocol::{Change, ChangeFeed, ChangeSender, Collection, Record};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Entry {
    seq: u64,
    record: Record,
    deleted_at: Option<DateTime<Utc>>,
}

struct Watcher {
    filter: Filter,
    sender: ChangeSender,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    entries: HashMap<String, Entry>,
    unique: HashMap<(Collection, String), String>,
    watchers: Vec<Watcher>,
}

impl State {
    fn live(&self, collection: Collection, id: &str) -> Option<&Entry> {
        self.entries
            .get(id)
            .filter(|e| e.deleted_at.is_none() && e.record.collection() == collection)
    }

    fn publish(&mut self, change: &Change) {
        self.watchers.retain(|w| {
            if w.sender.is_closed() {
                return false;
            }
            if w.filter.matches(change.record()) {
                // A send failure means the receiver dropped between checks.
                return w.sender.send(change.clone()).is_ok();
            }
            true
        });
    }

    fn snapshot(&self, filter: &Filter) -> Vec<Record> {
        let mut live: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.deleted_at.is_none() && filter.matches(&e.record))
            .collect();
        live.sort_by_key(|e| e.seq);
        live.into_iter().map(|e| e.record.clone()).collect()
    }
}

/// Strictly increasing version stamp.
fn next_version(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + ChronoDuration::microseconds(1)
    }
}

/// Document store held in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_string()))
    }

    /// Number of soft-deleted records retained.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the store mutex is poisoned.
    pub fn tombstone_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.deleted_at.is_some())
            .count())
    }

    fn remove_locked(state: &mut State, collection: Collection, id: &str) -> Option<Record> {
        let entry = state
            .entries
            .get_mut(id)
            .filter(|e| e.deleted_at.is_none() && e.record.collection() == collection)?;
        entry.deleted_at = Some(Utc::now());
        let record = entry.record.clone();
        if let Some(key) = record.unique_key() {
            state.unique.remove(&(collection, key));
        }
        state.publish(&Change::Removed(record.clone()));
        Some(record)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, record: Record) -> Result<Record, StoreError> {
        let mut state = self.lock()?;
        let collection = record.collection();
        let id = record.id().to_string();

        if state.entries.contains_key(&id) {
            return Err(StoreError::DuplicateKey {
                collection,
                key: id,
            });
        }
        if let Some(key) = record.unique_key() {
            if state.unique.contains_key(&(collection, key.clone())) {
                return Err(StoreError::DuplicateKey { collection, key });
            }
            state.unique.insert((collection, key), id.clone());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            Entry {
                seq,
                record: record.clone(),
                deleted_at: None,
            },
        );
        state.publish(&Change::Added(record.clone()));
        Ok(record)
    }

    async fn replace(&self, mut record: Record) -> Result<Record, StoreError> {
        let mut state = self.lock()?;
        let collection = record.collection();
        let id = record.id().to_string();

        let Some(current) = state.live(collection, &id) else {
            return Err(StoreError::NotFound { collection, id });
        };
        if current.record.meta().updated_at != record.meta().updated_at {
            return Err(StoreError::Stale { collection, id });
        }

        let old_key = current.record.unique_key();
        let new_key = record.unique_key();
        if old_key != new_key {
            if let Some(key) = &new_key {
                if state.unique.contains_key(&(collection, key.clone())) {
                    return Err(StoreError::DuplicateKey {
                        collection,
                        key: key.clone(),
                    });
                }
            }
            if let Some(key) = old_key {
                state.unique.remove(&(collection, key));
            }
            if let Some(key) = new_key {
                state.unique.insert((collection, key), id.clone());
            }
        }

        let meta = record.meta_mut();
        meta.updated_at = next_version(meta.updated_at);

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.record = record.clone();
        }
        state.publish(&Change::Changed(record.clone()));
        Ok(record)
    }

    async fn remove(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        let mut state = self.lock()?;
        Ok(Self::remove_locked(&mut state, collection, id))
    }

    async fn remove_if_unchanged(
        &self,
        collection: Collection,
        id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let current = state
            .live(collection, id)
            .map(|e| e.record.meta().updated_at);
        if current != Some(updated_at) {
            return Ok(false);
        }
        Ok(Self::remove_locked(&mut state, collection, id).is_some())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, StoreError> {
        let state = self.lock()?;
        Ok(state.live(collection, id).map(|e| e.record.clone()))
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let state = self.lock()?;
        Ok(state.snapshot(filter))
    }

    async fn watch(&self, filter: Filter) -> Result<(Vec<Record>, ChangeFeed), StoreError> {
        let mut state = self.lock()?;
        let snapshot = state.snapshot(&filter);
        let (sender, feed) = mpsc::unbounded_channel();
        state.watchers.push(Watcher { filter, sender });
        Ok((snapshot, feed))
    }

    async fn purge_removed(&self, removed_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !matches!(e.deleted_at, Some(at) if at < removed_before));
        Ok(before - state.entries.len())
    }
}
