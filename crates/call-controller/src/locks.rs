//! Named, renewable locks backed by the document store.
//!
//! A lock is a `LockRecord` unique on its name; inserting it acquires it and
//! the store's unique key arbitrates races. While held, a renewal task bumps
//! `renewed_at`. A lock whose `renewed_at` is older than the preempt timeout
//! belongs to a dead or stalled holder and may be reclaimed by removing it at
//! the observed version.
//!
//! Callers must re-read any state they decide on inside the lock: a lease can
//! be reclaimed externally, so nothing read before acquiring is trustworthy.

use crate::errors::CallError;
use crate::observability::metrics;
use crate::store::{DocumentStore, DocumentStoreExt, Filter, StoreError};
use call_protocol::{Collection, DocMeta, LockRecord};
use chrono::Utc;
use common::types::{ServerId, UserId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, instrument, warn};

/// Lock timing.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Age of `renewed_at` after which a lock may be reclaimed.
    pub preempt: Duration,
    /// Renewal interval while held. Also the retry interval while waiting.
    pub renew: Duration,
}

/// Lock name guarding room-ownership decisions for one call.
#[must_use]
pub fn room_lock_name(call: &common::types::CallId) -> String {
    format!("room:{call}")
}

/// Acquires and releases named locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    holder: UserId,
    config: LockConfig,
}

/// A held lease. Dropping it without [`HeldLock::release`] (the `with_lock`
/// future was cancelled) stops renewal and removes the record in the
/// background.
struct HeldLock {
    store: Arc<dyn DocumentStore>,
    record: LockRecord,
    lost: Arc<AtomicBool>,
    renewal: Option<DropGuard>,
    released: bool,
}

impl HeldLock {
    /// Stop renewing and remove the record. Returns whether the lease was
    /// lost while held.
    async fn release(mut self) -> bool {
        self.renewal.take();
        if let Err(e) = self
            .store
            .remove(Collection::Locks, &self.record.meta.id)
            .await
        {
            warn!(target: "cc.locks", lock = %self.record.name, error = %e, "Failed to release lock");
        }
        self.released = true;
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.renewal.take();
        let store = Arc::clone(&self.store);
        let id = self.record.meta.id.clone();
        let name = self.record.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.remove(Collection::Locks, &id).await {
                        Ok(_) => debug!(target: "cc.locks", lock = %name, "Released abandoned lock"),
                        Err(e) => warn!(target: "cc.locks", lock = %name, error = %e, "Failed to release abandoned lock"),
                    }
                });
            }
            Err(_) => {
                warn!(target: "cc.locks", lock = %name, "Lock dropped outside a runtime, left to preemption");
            }
        }
    }
}

impl LockManager {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, server: &ServerId, config: LockConfig) -> Self {
        Self {
            store,
            holder: UserId::from(server.as_str()),
            config,
        }
    }

    /// Run `f` while holding the lock `name`.
    ///
    /// The lock is released after `f` completes, whether it succeeded or not,
    /// and also when this future is dropped before completing.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, a store error while acquiring, or
    /// `CallError::LockLost` if the lock was reclaimed while `f` ran.
    #[instrument(skip_all, name = "cc.locks.with_lock", fields(lock = %name))]
    pub async fn with_lock<T, F, Fut>(&self, name: &str, f: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let started = Instant::now();
        let held = self.acquire(name).await?;
        metrics::record_lock_wait(started.elapsed());

        let result = f().await;

        if held.release().await {
            warn!(target: "cc.locks", lock = %name, "Lock was reclaimed while held");
            return Err(CallError::LockLost(name.to_string()));
        }
        result
    }

    async fn acquire(&self, name: &str) -> Result<HeldLock, CallError> {
        // Subscribe before trying so a release between the failed insert and
        // the wait is never missed.
        let (_, mut feed) = self.store.watch(Filter::collection(Collection::Locks)).await?;

        loop {
            let meta = DocMeta::new(&self.holder);
            let renewed_at = meta.created_at;
            let candidate = LockRecord {
                meta,
                name: name.to_string(),
                renewed_at,
            };

            match self.store.insert_doc(candidate).await {
                Ok(record) => {
                    debug!(target: "cc.locks", lock = %name, "Lock acquired");
                    return Ok(self.spawn_renewal(record));
                }
                Err(StoreError::DuplicateKey { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            if self.try_reclaim(name).await? {
                continue;
            }

            // Wait for a release (or a reclaim window), then retry.
            let deadline = Instant::now() + self.config.renew;
            loop {
                match tokio::time::timeout_at(deadline, feed.recv()).await {
                    Ok(Some(change)) => {
                        let released = change.is_removed()
                            && matches!(change.record(), call_protocol::Record::Lock(l) if l.name == name);
                        if released {
                            break;
                        }
                    }
                    Ok(None) => {
                        return Err(CallError::Internal("lock feed closed".to_string()));
                    }
                    Err(_) => break,
                }
            }
        }
    }

    /// Remove the current holder's record if it has not been renewed within
    /// the preempt timeout.
    async fn try_reclaim(&self, name: &str) -> Result<bool, CallError> {
        let existing = self
            .store
            .find_docs::<LockRecord>(Filter::collection(Collection::Locks))
            .await?
            .into_iter()
            .find(|l| l.name == name);

        let Some(existing) = existing else {
            // Released between our insert and the lookup.
            return Ok(true);
        };

        let preempt = chrono::Duration::from_std(self.config.preempt)
            .map_err(|e| CallError::Config(format!("lock preempt out of range: {e}")))?;
        if Utc::now() - existing.renewed_at < preempt {
            return Ok(false);
        }

        let removed = self
            .store
            .remove_if_unchanged(
                Collection::Locks,
                &existing.meta.id,
                existing.meta.updated_at,
            )
            .await?;
        if removed {
            warn!(
                target: "cc.locks",
                lock = %name,
                holder = %existing.meta.created_by,
                "Reclaimed stale lock"
            );
            metrics::record_lock_reclaimed();
        }
        Ok(true)
    }

    fn spawn_renewal(&self, record: LockRecord) -> HeldLock {
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = CancellationToken::new();

        let store = Arc::clone(&self.store);
        let interval = self.config.renew;
        let task_lost = Arc::clone(&lost);
        let task_token = renewal.clone();
        let mut current = record.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut renewed = current.clone();
                        renewed.renewed_at = Utc::now();
                        match store.replace_doc(renewed).await {
                            Ok(updated) => current = updated,
                            Err(_) if task_token.is_cancelled() => break,
                            Err(e) => {
                                warn!(
                                    target: "cc.locks",
                                    lock = %current.name,
                                    error = %e,
                                    "Lock renewal failed, lease lost"
                                );
                                task_lost.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
            }
        });

        HeldLock {
            store: Arc::clone(&self.store),
            record,
            lost,
            renewal: Some(renewal.drop_guard()),
            released: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn manager(store: &MemoryStore, server: &str) -> LockManager {
        LockManager::new(
            Arc::new(store.clone()),
            &ServerId::from(server),
            LockConfig {
                preempt: Duration::from_secs(10),
                renew: Duration::from_millis(50),
            },
        )
    }

    async fn live_locks(store: &MemoryStore) -> Vec<LockRecord> {
        store
            .find_docs::<LockRecord>(Filter::collection(Collection::Locks))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lock_released_after_closure() {
        let store = MemoryStore::new();
        let locks = manager(&store, "cc-1");

        let value = locks
            .with_lock("room:c1", || async { Ok::<_, CallError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(live_locks(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let store = MemoryStore::new();
        let locks = manager(&store, "cc-1");

        let err = locks
            .with_lock("room:c1", || async {
                Err::<(), _>(CallError::Conflict("nope".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Conflict(_)));
        assert!(live_locks(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let store = MemoryStore::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let locks = manager(&store, &format!("cc-{i}"));
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock("room:c1", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CallError>(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let store = MemoryStore::new();
        let mut meta = DocMeta::new(&UserId::from("cc-dead"));
        meta.created_at = Utc::now() - chrono::Duration::seconds(60);
        let renewed_at = meta.created_at;
        store
            .insert_doc(LockRecord {
                meta,
                name: "room:c1".to_string(),
                renewed_at,
            })
            .await
            .unwrap();

        let locks = manager(&store, "cc-1");
        locks
            .with_lock("room:c1", || async { Ok::<_, CallError>(()) })
            .await
            .unwrap();
        assert!(live_locks(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_renewal_bumps_renewed_at() {
        let store = MemoryStore::new();
        let locks = manager(&store, "cc-1");
        let observer = store.clone();

        locks
            .with_lock("room:c1", || async move {
                let first = live_locks(&observer).await.remove(0);
                tokio::time::sleep(Duration::from_millis(200)).await;
                let later = live_locks(&observer).await.remove(0);
                assert!(later.renewed_at > first.renewed_at);
                Ok::<_, CallError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_holder_releases_lock() {
        let store = MemoryStore::new();
        let first = manager(&store, "cc-a");
        let second = manager(&store, "cc-b");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            first.with_lock("room:c1", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, CallError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        // Preemption is 10s here, so only the release on drop lets this in.
        let acquired = tokio::time::timeout(
            Duration::from_secs(2),
            second.with_lock("room:c1", || async { Ok::<_, CallError>(7) }),
        )
        .await
        .expect("lock still held by a cancelled caller");
        assert_eq!(acquired.unwrap(), 7);

        // Renewal stopped with the holder: nothing brings the record back.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(live_locks(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_lock_is_reported() {
        let store = MemoryStore::new();
        let locks = manager(&store, "cc-1");
        let thief = store.clone();

        let err = locks
            .with_lock("room:c1", || async move {
                let held = live_locks(&thief).await.remove(0);
                thief
                    .remove(Collection::Locks, &held.meta.id)
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, CallError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::LockLost(_)));
    }
}
