//! Per-collection locks for multi-step critical sections.
//!
//! `TigerStyle`: FIFO waiters, optional timeout, no busy polling.
//!
//! Single CRUD calls never take these locks; they exist for callers that
//! need read-modify-write sequences to be exclusive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

use crate::collection::Collection;
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Default)]
struct HeldTracker {
    held: AtomicUsize,
    released: Notify,
}

/// Exclusive hold on one collection; released on drop.
#[derive(Debug)]
pub struct CollectionGuard {
    collection: Collection,
    tracker: Arc<HeldTracker>,
    _guard: OwnedMutexGuard<()>,
}

impl CollectionGuard {
    /// Collection held by this guard.
    #[must_use]
    pub fn collection(&self) -> Collection {
        self.collection
    }
}

impl Drop for CollectionGuard {
    fn drop(&mut self) {
        self.tracker.held.fetch_sub(1, Ordering::AcqRel);
        self.tracker.released.notify_waiters();
        tracing::trace!(collection = %self.collection, "collection lock released");
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<Collection, Arc<AsyncMutex<()>>>>,
    tracker: Arc<HeldTracker>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for the collection's lock, at most `timeout` if given.
    pub(crate) async fn acquire(
        &self,
        collection: Collection,
        timeout: Option<Duration>,
    ) -> StorageResult<CollectionGuard> {
        let mutex = Arc::clone(self.locks.lock().entry(collection).or_default());

        let guard = match timeout {
            Some(limit) => tokio::time::timeout(limit, mutex.lock_owned())
                .await
                .map_err(|_| {
                    StorageError::lock_timeout(
                        collection,
                        u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    )
                })?,
            None => mutex.lock_owned().await,
        };

        self.tracker.held.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(collection = %collection, "collection lock acquired");
        Ok(CollectionGuard {
            collection,
            tracker: Arc::clone(&self.tracker),
            _guard: guard,
        })
    }

    pub(crate) fn held(&self) -> usize {
        self.tracker.held.load(Ordering::Acquire)
    }

    /// Wait until no guard is held; `false` if `timeout` elapsed first.
    pub(crate) async fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.tracker.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.held() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.held() == 0;
            }
        }
    }

    /// Forget every lock. Outstanding guards keep their old mutex.
    pub(crate) fn force_clear(&self) {
        self.locks.lock().clear();
    }
}
