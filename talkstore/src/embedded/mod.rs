//! EmbeddedStore - File-Backed In-Process Backend
//!
//! `TigerStyle`: In-memory collections, explicit persistence, bounded cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      EmbeddedStore                       │
//! ├──────────────────────────────────────────────────────────┤
//! │  RwLock<StoreData>   collections (insertion order)       │
//! │                      + hash indexes per collection       │
//! │  QueryCache          LRU of find_all results             │
//! │  LockTable           opt-in per-collection FIFO locks    │
//! │  WriteBuffer         debounced background flushes        │
//! │  EventBus            Ready/Created/Updated/Deleted/Closed│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each CRUD call is atomic with respect to in-memory state. Multi-step
//! sequences use [`EmbeddedStore::with_lock`].

mod cache;
mod events;
mod index;
mod lock;
mod persist;

pub use events::StoreEvent;
pub use lock::CollectionGuard;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use self::cache::{CacheKey, QueryCache};
use self::events::EventBus;
use self::index::HashIndex;
use self::lock::LockTable;
use self::persist::{WriteBuffer, WriterStats};
use crate::backend::{BackendKind, HealthStatus, PerformanceStats, StorageBackend, StoreState};
use crate::collection::Collection;
use crate::config::EmbeddedConfig;
use crate::constants::EMBEDDED_EVENT_CHANNEL_CAPACITY;
use crate::document::{now_millis, time_based_id, Document, Fields};
use crate::dst::{DeterministicRng, FaultInjector};
use crate::error::{StorageError, StorageResult};
use crate::lifecycle::{Lifecycle, QueryCounters};
use crate::query::{Filter, FindOptions};
use crate::settings::SiteDefaults;

// =============================================================================
// In-Memory State
// =============================================================================

#[derive(Debug, Default)]
struct CollectionData {
    docs: IndexMap<String, Document>,
    indexes: Vec<HashIndex>,
}

impl CollectionData {
    fn select(&self, filter: &Filter) -> Vec<Document> {
        if let Some(index) = self.indexes.iter().find(|i| i.covers(filter)) {
            let Some(ids) = index.lookup(filter) else {
                return Vec::new();
            };
            let mut positions: Vec<usize> = ids
                .iter()
                .filter_map(|id| self.docs.get_index_of(id))
                .collect();
            positions.sort_unstable();
            return positions
                .into_iter()
                .filter_map(|pos| self.docs.get_index(pos).map(|(_, doc)| doc))
                .filter(|doc| filter.matches(doc))
                .cloned()
                .collect();
        }

        self.docs
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect()
    }

    fn replace(&mut self, docs: Vec<Document>) -> StorageResult<()> {
        let mut map = IndexMap::with_capacity(docs.len());
        for doc in docs {
            if map.contains_key(&doc.id) {
                return Err(StorageError::validation(format!(
                    "duplicate id {} in collection data",
                    doc.id
                )));
            }
            map.insert(doc.id.clone(), doc);
        }
        self.docs = map;
        for index in &mut self.indexes {
            index.rebuild(self.docs.values());
        }
        Ok(())
    }
}

/// All collections, shared with the writer task.
#[derive(Debug, Default)]
pub(crate) struct StoreData {
    collections: BTreeMap<Collection, CollectionData>,
}

impl StoreData {
    /// Documents of one collection in insertion order.
    pub(crate) fn snapshot(&self, collection: Collection) -> Vec<Document> {
        self.collections
            .get(&collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut CollectionData {
        self.collections.entry(collection).or_default()
    }
}

// =============================================================================
// EmbeddedStore
// =============================================================================

/// File-backed store holding every collection in memory.
///
/// # Example
///
/// ```rust,no_run
/// use talkstore::{Collection, EmbeddedConfig, EmbeddedStore, StorageBackend};
///
/// # async fn run() -> talkstore::StorageResult<()> {
/// let store = EmbeddedStore::new(EmbeddedConfig::new("./data"));
/// store.initialize().await?;
/// let fields = serde_json::json!({"title": "Lightning night"});
/// let event = store
///     .create(Collection::Events, fields.as_object().cloned().unwrap_or_default())
///     .await?;
/// assert!(store.find_by_id(Collection::Events, &event.id).await?.is_some());
/// store.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EmbeddedStore {
    config: EmbeddedConfig,
    site: SiteDefaults,
    data: Arc<RwLock<StoreData>>,
    cache: Mutex<QueryCache>,
    locks: LockTable,
    writer: Mutex<Option<WriteBuffer>>,
    writer_stats: Arc<WriterStats>,
    rng: Mutex<DeterministicRng>,
    faults: Arc<FaultInjector>,
    lifecycle: Lifecycle,
    counters: QueryCounters,
    events: EventBus,
    ready: watch::Sender<bool>,
}

impl EmbeddedStore {
    /// Uninitialized store over `config.data_dir`.
    #[must_use]
    pub fn new(config: EmbeddedConfig) -> Self {
        let cache = QueryCache::new(config.query_cache_entries);
        let (ready, _) = watch::channel(false);
        Self {
            config,
            site: SiteDefaults::default(),
            data: Arc::new(RwLock::new(StoreData::default())),
            cache: Mutex::new(cache),
            locks: LockTable::new(),
            writer: Mutex::new(None),
            writer_stats: Arc::new(WriterStats::default()),
            rng: Mutex::new(DeterministicRng::from_entropy()),
            faults: Arc::new(FaultInjector::disabled()),
            lifecycle: Lifecycle::new(),
            counters: QueryCounters::default(),
            events: EventBus::new(EMBEDDED_EVENT_CHANNEL_CAPACITY),
            ready,
        }
    }

    /// Values seeded into an empty settings collection.
    #[must_use]
    pub fn with_site_defaults(mut self, site: SiteDefaults) -> Self {
        self.site = site;
        self
    }

    /// Draw id suffixes from `rng`.
    #[must_use]
    pub fn with_rng(mut self, rng: DeterministicRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Share a fault injector for persistence faults.
    #[must_use]
    pub fn with_fault_injector(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EmbeddedConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StoreState {
        self.lifecycle.state()
    }

    /// Receive store events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Wait until the store is `Ready`.
    ///
    /// # Errors
    /// `NotInitialized` if `timeout` elapses first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> StorageResult<()> {
        let mut rx = self.ready.subscribe();
        let became_ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        if became_ready {
            Ok(())
        } else {
            Err(StorageError::not_initialized(self.lifecycle.state()))
        }
    }

    /// Flushes that wrote at least one collection since construction.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.writer_stats.flushes.load(Ordering::Acquire)
    }

    /// Write every dirty collection now.
    ///
    /// # Errors
    /// The first write failure; failed collections stay dirty.
    pub async fn flush(&self) -> StorageResult<()> {
        self.lifecycle.ensure_ready()?;
        let flusher = self.writer.lock().as_ref().map(WriteBuffer::flusher);
        match flusher {
            Some(flusher) => flusher.flush().await,
            None => Err(StorageError::not_initialized(self.lifecycle.state())),
        }
    }

    // -------------------------------------------------------------------------
    // Indexes
    // -------------------------------------------------------------------------

    /// Build a hash index over `fields`; rebuilds an existing one.
    ///
    /// # Errors
    /// `Validation` if `fields` is empty.
    #[tracing::instrument(skip(self))]
    pub fn create_index(&self, collection: Collection, fields: &[&str]) -> StorageResult<()> {
        self.lifecycle.ensure_ready()?;
        if fields.is_empty() {
            return Err(StorageError::validation("index needs at least one field"));
        }
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();

        let mut data = self.data.write();
        let coll = data.collection_mut(collection);
        coll.indexes.retain(|i| !i.has_field_set(&fields));
        let index = HashIndex::build(fields, coll.docs.values());
        coll.indexes.push(index);
        tracing::info!(collection = %collection, docs = coll.docs.len(), "index built");
        Ok(())
    }

    /// Remove the index over `fields`; `false` if there was none.
    ///
    /// # Errors
    /// `NotInitialized` outside `Ready`.
    pub fn drop_index(&self, collection: Collection, fields: &[&str]) -> StorageResult<bool> {
        self.lifecycle.ensure_ready()?;
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
        let mut data = self.data.write();
        let coll = data.collection_mut(collection);
        let before = coll.indexes.len();
        coll.indexes.retain(|i| !i.has_field_set(&fields));
        Ok(coll.indexes.len() < before)
    }

    /// Rebuild every index of `collection` from current data.
    ///
    /// # Errors
    /// `NotInitialized` outside `Ready`.
    pub fn rebuild_indexes(&self, collection: Collection) -> StorageResult<()> {
        self.lifecycle.ensure_ready()?;
        let mut data = self.data.write();
        let coll = data.collection_mut(collection);
        let CollectionData { docs, indexes } = coll;
        for index in indexes.iter_mut() {
            index.rebuild(docs.values());
        }
        Ok(())
    }

    /// Field sets of the indexes defined on `collection`.
    #[must_use]
    pub fn indexes(&self, collection: Collection) -> Vec<Vec<String>> {
        self.data
            .read()
            .collections
            .get(&collection)
            .map(|c| c.indexes.iter().map(|i| i.fields().to_vec()).collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Locks
    // -------------------------------------------------------------------------

    /// Take the collection's exclusive lock, waiting at most `timeout`.
    ///
    /// # Errors
    /// `LockTimeout` if the wait exceeds `timeout`.
    pub async fn acquire_lock(
        &self,
        collection: Collection,
        timeout: Option<Duration>,
    ) -> StorageResult<CollectionGuard> {
        self.lifecycle.ensure_ready()?;
        self.locks.acquire(collection, timeout).await
    }

    /// Release a lock taken with [`EmbeddedStore::acquire_lock`].
    pub fn release_lock(&self, guard: CollectionGuard) {
        drop(guard);
    }

    /// Run `op` while holding the collection's lock.
    ///
    /// # Errors
    /// `LockTimeout`, or whatever `op` returns.
    pub async fn with_lock<T, F, Fut>(
        &self,
        collection: Collection,
        timeout: Option<Duration>,
        op: F,
    ) -> StorageResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let guard = self.acquire_lock(collection, timeout).await?;
        let result = op().await;
        self.release_lock(guard);
        result
    }

    // -------------------------------------------------------------------------
    // Bulk Replacement
    // -------------------------------------------------------------------------

    /// Replace the named collections wholesale and persist them now.
    ///
    /// Returns the number of documents imported.
    ///
    /// # Errors
    /// `Validation` on duplicate ids; write failures from the flush.
    #[tracing::instrument(skip(self, data), fields(collections = data.len()))]
    pub async fn import_data(
        &self,
        data: BTreeMap<Collection, Vec<Document>>,
    ) -> StorageResult<usize> {
        self.lifecycle.ensure_ready()?;
        let mut imported = 0;
        {
            let mut store = self.data.write();
            // Validate everything before touching state.
            let mut staged = Vec::with_capacity(data.len());
            for (collection, docs) in data {
                let mut replacement = CollectionData::default();
                replacement.replace(docs)?;
                staged.push((collection, replacement.docs));
            }
            let mut cache = self.cache.lock();
            for (collection, docs) in staged {
                imported += docs.len();
                let coll = store.collection_mut(collection);
                coll.docs = docs;
                let CollectionData { docs, indexes } = coll;
                for index in indexes.iter_mut() {
                    index.rebuild(docs.values());
                }
                cache.invalidate_collection(collection);
                self.mark_dirty(collection);
            }
        }

        self.flush().await?;
        tracing::info!(documents = imported, "imported collection data");
        Ok(imported)
    }

    /// Replace the named collections with documents built from raw fields.
    ///
    /// Supplied ids and `createdAt` are kept; the rest are generated.
    ///
    /// # Errors
    /// `Validation` on malformed ids/timestamps or duplicate ids.
    pub async fn seed(&self, data: BTreeMap<Collection, Vec<Fields>>) -> StorageResult<usize> {
        let now = now_millis();
        let mut docs = BTreeMap::new();
        {
            let mut rng = self.rng.lock();
            for (collection, inputs) in data {
                let built = inputs
                    .into_iter()
                    .map(|fields| Document::from_input(fields, now, || time_based_id(now, &mut rng)))
                    .collect::<StorageResult<Vec<_>>>()?;
                docs.insert(collection, built);
            }
        }
        self.import_data(docs).await
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn mark_dirty(&self, collection: Collection) {
        if let Some(writer) = self.writer.lock().as_ref() {
            writer.mark_dirty(collection);
        }
    }

    fn generate_id(&self, now: chrono::DateTime<chrono::Utc>) -> String {
        time_based_id(now, &mut self.rng.lock())
    }

    async fn open(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        let mut loaded = Vec::with_capacity(Collection::all().len());
        for collection in Collection::all() {
            let docs =
                persist::read_collection_file(&self.config.data_dir, *collection, &self.faults)
                    .await?;
            loaded.push((*collection, docs));
        }

        let needs_settings = loaded
            .iter()
            .any(|(c, docs)| *c == Collection::Settings && docs.is_empty());
        {
            let mut data = self.data.write();
            *data = StoreData::default();
            for (collection, docs) in loaded {
                data.collection_mut(collection).replace(docs)?;
            }
        }
        self.cache.lock().clear();

        if needs_settings {
            let now = now_millis();
            let settings = Document::from_input(self.site.settings_document(), now, || {
                self.generate_id(now)
            })?;
            persist::write_collection_file(
                &self.config.data_dir,
                Collection::Settings,
                std::slice::from_ref(&settings),
                &self.faults,
            )
            .await?;
            self.data
                .write()
                .collection_mut(Collection::Settings)
                .replace(vec![settings])?;
            tracing::info!("seeded default settings");
        }

        let writer = WriteBuffer::spawn(
            self.config.data_dir.clone(),
            self.config.save_debounce,
            Arc::clone(&self.data),
            Arc::clone(&self.faults),
            Arc::clone(&self.writer_stats),
        );
        *self.writer.lock() = Some(writer);
        Ok(())
    }

    /// Apply a mutation under the data lock, then invalidate and queue a save.
    fn mutate<T>(
        &self,
        collection: Collection,
        apply: impl FnOnce(&mut CollectionData) -> StorageResult<(T, StoreEvent)>,
    ) -> StorageResult<T> {
        let (value, event) = {
            let mut data = self.data.write();
            let outcome = apply(data.collection_mut(collection))?;
            // Invalidate before readers can observe the new data.
            self.cache.lock().invalidate_collection(collection);
            outcome
        };
        self.mark_dirty(collection);
        self.events.emit(event);
        Ok(value)
    }
}

#[async_trait]
impl StorageBackend for EmbeddedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    #[tracing::instrument(skip(self), fields(data_dir = %self.config.data_dir.display()))]
    async fn initialize(&self) -> StorageResult<()> {
        if !self.lifecycle.begin_initialize()? {
            return Ok(());
        }

        if let Err(e) = self.open().await {
            self.lifecycle.mark_failed();
            *self.data.write() = StoreData::default();
            tracing::error!(error = %e, "embedded store failed to initialize");
            return Err(e);
        }

        self.lifecycle.mark_ready();
        self.ready.send_replace(true);
        self.events.emit(StoreEvent::Ready);
        tracing::info!("embedded store ready");
        Ok(())
    }

    async fn find_all(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>> {
        self.lifecycle.ensure_ready()?;
        let started = Instant::now();
        let key = CacheKey::new(collection, filter, options);

        let cached = self.cache.lock().get(&key);
        if let Some(hit) = cached {
            self.counters.record_cache(true);
            self.counters.record_query(started.elapsed());
            return Ok(hit);
        }
        self.counters.record_cache(false);

        let result = {
            let data = self.data.read();
            let docs = data
                .collections
                .get(&collection)
                .map(|c| c.select(filter))
                .unwrap_or_default();
            let result = options.apply(docs);
            // Stored under the read lock so a concurrent write cannot be
            // invalidated before this entry lands.
            self.cache.lock().put(key, result.clone());
            result
        };

        self.counters.record_query(started.elapsed());
        Ok(result)
    }

    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> StorageResult<Option<Document>> {
        self.lifecycle.ensure_ready()?;
        Ok(self
            .data
            .read()
            .collections
            .get(&collection)
            .and_then(|c| c.docs.get(id).cloned()))
    }

    async fn create(&self, collection: Collection, fields: Fields) -> StorageResult<Document> {
        self.lifecycle.ensure_ready()?;
        let now = now_millis();
        let doc = Document::from_input(fields, now, || self.generate_id(now))?;

        self.mutate(collection, |coll| {
            if coll.docs.contains_key(&doc.id) {
                return Err(StorageError::duplicate_key(collection, doc.id.clone()));
            }
            for index in &mut coll.indexes {
                index.insert(&doc);
            }
            coll.docs.insert(doc.id.clone(), doc.clone());
            let event = StoreEvent::Created {
                collection,
                id: doc.id.clone(),
            };
            Ok((doc, event))
        })
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Fields,
    ) -> StorageResult<Document> {
        self.lifecycle.ensure_ready()?;
        let now = now_millis();

        self.mutate(collection, |coll| {
            let CollectionData { docs, indexes } = coll;
            let doc = docs
                .get_mut(id)
                .ok_or_else(|| StorageError::not_found(collection, id))?;
            for index in indexes.iter_mut() {
                index.remove(doc);
            }
            doc.apply_patch(patch, now);
            for index in indexes.iter_mut() {
                index.insert(doc);
            }
            let event = StoreEvent::Updated {
                collection,
                id: id.to_string(),
            };
            Ok((doc.clone(), event))
        })
    }

    async fn delete(&self, collection: Collection, id: &str) -> StorageResult<Document> {
        self.lifecycle.ensure_ready()?;

        self.mutate(collection, |coll| {
            let doc = coll
                .docs
                .shift_remove(id)
                .ok_or_else(|| StorageError::not_found(collection, id))?;
            for index in &mut coll.indexes {
                index.remove(&doc);
            }
            let event = StoreEvent::Deleted {
                collection,
                id: id.to_string(),
            };
            Ok((doc, event))
        })
    }

    async fn health(&self) -> StorageResult<HealthStatus> {
        let state = self.lifecycle.state();
        let mut status = HealthStatus::new(self.kind(), state).with_uptime(self.lifecycle.uptime());
        status.pending_writes = self.writer_stats.pending.load(Ordering::Acquire);
        if status.healthy && tokio::fs::metadata(&self.config.data_dir).await.is_err() {
            status.healthy = false;
            status.detail = Some(format!(
                "data directory {} is not accessible",
                self.config.data_dir.display()
            ));
        }
        Ok(status)
    }

    async fn performance_stats(&self) -> StorageResult<PerformanceStats> {
        self.lifecycle.ensure_ready()?;
        let (record_counts, index_count) = {
            let data = self.data.read();
            let counts = Collection::all()
                .iter()
                .map(|c| (*c, data.collections.get(c).map_or(0, |d| d.docs.len())))
                .collect();
            let indexes = data.collections.values().map(|c| c.indexes.len()).sum();
            (counts, indexes)
        };
        Ok(PerformanceStats {
            record_counts,
            query_count: self.counters.queries(),
            cache_hits: self.counters.cache_hits(),
            cache_misses: self.counters.cache_misses(),
            cache_hit_rate: self.counters.cache_hit_rate(),
            average_query_ms: self.counters.average_query_ms(),
            cache_entries: self.cache.lock().len(),
            index_count,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn close(&self) -> StorageResult<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        self.ready.send_replace(false);

        if !self.locks.wait_released(self.config.close_lock_wait).await {
            tracing::warn!(
                held = self.locks.held(),
                "collection locks still held at close, clearing lock table"
            );
            self.locks.force_clear();
        }

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(error = %e, "final flush failed during close");
            }
        }

        *self.data.write() = StoreData::default();
        self.cache.lock().clear();
        self.counters.reset();

        self.lifecycle.mark_closed();
        self.events.emit(StoreEvent::Closed);
        tracing::info!("embedded store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::query::SortOrder;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn open_store(dir: &std::path::Path) -> EmbeddedStore {
        let config = EmbeddedConfig::new(dir).with_save_debounce(Duration::from_millis(20));
        let store = EmbeddedStore::new(config).with_rng(DeterministicRng::new(7));
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::new(EmbeddedConfig::new(dir.path()));
        let err = store.find(Collection::Events, &Filter::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotInitialized { .. }));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_seeds_settings_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for collection in Collection::all() {
            assert!(persist::collection_path(dir.path(), *collection).exists());
        }
        let settings = store.get_settings().await.unwrap();
        assert_eq!(settings["siteName"], "なんでもライトニングトーク");
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_generates_time_based_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let doc = store
            .create(Collection::Talks, fields(json!({"title": "t"})))
            .await
            .unwrap();
        let (millis, suffix) = doc.id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert_eq!(doc.created_at, doc.updated_at);

        let dup = store
            .create(Collection::Talks, fields(json!({"id": doc.id})))
            .await
            .unwrap_err();
        assert!(matches!(dup, StorageError::DuplicateKey { .. }));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_and_delete_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let err = store
            .update(Collection::Users, "ghost", Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        let err = store.delete(Collection::Users, "ghost").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_index_path_matches_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for (event, status) in [("e1", "confirmed"), ("e2", "confirmed"), ("e1", "waitlist"), ("e1", "confirmed")] {
            store
                .create(
                    Collection::Participants,
                    fields(json!({"eventId": event, "status": status})),
                )
                .await
                .unwrap();
        }
        let filter = Filter::new().eq("eventId", "e1").eq("status", "confirmed");
        let scanned = store.find(Collection::Participants, &filter).await.unwrap();

        store
            .create_index(Collection::Participants, &["eventId", "status"])
            .unwrap();
        store
            .create(
                Collection::Participants,
                fields(json!({"eventId": "e1", "status": "confirmed"})),
            )
            .await
            .unwrap();
        let indexed = store.find(Collection::Participants, &filter).await.unwrap();

        assert_eq!(scanned.len(), 2);
        assert_eq!(indexed.len(), 3);
        assert_eq!(indexed[..2], scanned[..]);

        assert!(store
            .drop_index(Collection::Participants, &["status", "eventId"])
            .unwrap());
        assert!(store.indexes(Collection::Participants).is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let filter = Filter::new().eq("status", "upcoming");
        store
            .create(Collection::Events, fields(json!({"status": "upcoming"})))
            .await
            .unwrap();
        assert_eq!(store.find(Collection::Events, &filter).await.unwrap().len(), 1);
        assert_eq!(store.find(Collection::Events, &filter).await.unwrap().len(), 1);

        store
            .create(Collection::Events, fields(json!({"status": "upcoming"})))
            .await
            .unwrap();
        assert_eq!(store.find(Collection::Events, &filter).await.unwrap().len(), 2);

        let stats = store.performance_stats().await.unwrap();
        assert_eq!(stats.query_count, 3);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sort_skip_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for n in [3, 1, 2, 5, 4] {
            store
                .create(Collection::Analytics, fields(json!({"n": n})))
                .await
                .unwrap();
        }
        let options = FindOptions::new()
            .sort_by("n", SortOrder::Asc)
            .with_skip(1)
            .with_limit(2);
        let page = store
            .find_all(Collection::Analytics, &Filter::new(), &options)
            .await
            .unwrap();
        let ns: Vec<&Value> = page.iter().map(|d| &d.fields["n"]).collect();
        assert_eq!(ns, vec![&json!(2), &json!(3)]);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut rx = store.subscribe();

        let doc = store
            .create(Collection::Users, fields(json!({"name": "ferris"})))
            .await
            .unwrap();
        store.delete(Collection::Users, &doc.id).await.unwrap();
        store.close().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::Created {
                collection: Collection::Users,
                id: doc.id.clone()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::Deleted {
                collection: Collection::Users,
                id: doc.id
            }
        );
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Closed);
    }

    #[tokio::test]
    async fn test_malformed_file_aborts_initialize() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("talks.json"), "[{").unwrap();

        let store = EmbeddedStore::new(EmbeddedConfig::new(dir.path()));
        let err = store.initialize().await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
        assert_eq!(store.state(), StoreState::Uninitialized);
        assert!(store.wait_until_ready(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_until_ready_released_by_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EmbeddedStore::new(EmbeddedConfig::new(dir.path())));

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_until_ready(Duration::from_secs(5)).await })
        };
        store.initialize().await.unwrap();

        waiter.await.unwrap().unwrap();
        store.wait_until_ready(Duration::from_millis(1)).await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_replaces_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store
            .create(Collection::Events, fields(json!({"title": "old"})))
            .await
            .unwrap();

        let mut data = BTreeMap::new();
        data.insert(
            Collection::Events,
            vec![
                fields(json!({"id": "e1", "title": "new"})),
                fields(json!({"title": "newer", "createdAt": "2025-01-01T00:00:00.000Z"})),
            ],
        );
        assert_eq!(store.seed(data).await.unwrap(), 2);

        let events = store.find(Collection::Events, &Filter::new()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "e1");
        assert_eq!(
            events[1].created_at,
            crate::document::parse_timestamp("2025-01-01T00:00:00.000Z").unwrap()
        );

        let on_disk = std::fs::read_to_string(persist::collection_path(dir.path(), Collection::Events)).unwrap();
        assert!(on_disk.contains("newer"));
        assert!(!on_disk.contains("\"old\""));
        store.close().await.unwrap();
    }
}
