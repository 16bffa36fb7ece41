//! Lifecycle - state machine and query counters shared by the backends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::StoreState;
use crate::error::{StorageError, StorageResult};

/// `Uninitialized -> Initializing -> Ready -> Closing -> Closed`.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<StoreState>,
    ready_at: Mutex<Option<Instant>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::Uninitialized),
            ready_at: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Move to `Initializing` unless already `Ready`.
    ///
    /// Returns `false` when there is nothing to do.
    pub(crate) fn begin_initialize(&self) -> StorageResult<bool> {
        let mut state = self.state.lock();
        match *state {
            StoreState::Ready => Ok(false),
            StoreState::Initializing | StoreState::Closing => {
                Err(StorageError::not_initialized(*state))
            }
            StoreState::Uninitialized | StoreState::Closed => {
                *state = StoreState::Initializing;
                Ok(true)
            }
        }
    }

    pub(crate) fn mark_ready(&self) {
        *self.state.lock() = StoreState::Ready;
        *self.ready_at.lock() = Some(Instant::now());
    }

    pub(crate) fn mark_failed(&self) {
        *self.state.lock() = StoreState::Uninitialized;
        *self.ready_at.lock() = None;
    }

    /// Move to `Closing`; returns `false` if the store was never opened.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            StoreState::Uninitialized | StoreState::Closed => {
                *state = StoreState::Closed;
                false
            }
            _ => {
                *state = StoreState::Closing;
                true
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = StoreState::Closed;
        *self.ready_at.lock() = None;
    }

    /// Fail with `NotInitialized` unless `Ready`.
    pub(crate) fn ensure_ready(&self) -> StorageResult<()> {
        let state = self.state();
        if state == StoreState::Ready {
            Ok(())
        } else {
            Err(StorageError::not_initialized(state))
        }
    }

    pub(crate) fn uptime(&self) -> Option<Duration> {
        self.ready_at.lock().map(|at| at.elapsed())
    }
}

/// Running `find_all` statistics.
#[derive(Debug, Default)]
pub(crate) struct QueryCounters {
    queries: AtomicU64,
    total_micros: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl QueryCounters {
    pub(crate) fn record_query(&self, elapsed: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub(crate) fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub(crate) fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub(crate) fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits();
        let lookups = hits + self.cache_misses();
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }

    pub(crate) fn average_query_ms(&self) -> f64 {
        let queries = self.queries();
        if queries == 0 {
            0.0
        } else {
            self.total_micros.load(Ordering::Relaxed) as f64 / queries as f64 / 1000.0
        }
    }

    pub(crate) fn reset(&self) {
        self.queries.store(0, Ordering::Relaxed);
        self.total_micros.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}
