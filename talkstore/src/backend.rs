//! Storage Backend Trait
//!
//! `TigerStyle`: One CRUD/query contract over every backend.
//!
//! # Simulation-First
//!
//! The embedded store and the in-process key-value client run every test
//! without external services. All implementations satisfy the same contract:
//! unique ids, immutable `createdAt`, refreshed `updatedAt`, conjunctive
//! filters and sort/skip/limit options.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::collection::Collection;
use crate::constants::EXPORT_FORMAT_VERSION;
use crate::document::{now_millis, Document, Fields};
use crate::error::{StorageError, StorageResult};
use crate::query::{Filter, FindOptions};

// =============================================================================
// Report Types
// =============================================================================

/// Which concrete backend is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// File-backed, in-process store
    Embedded,
    /// Pooled SQL store
    Relational,
    /// Managed key-value service
    Distributed,
}

impl BackendKind {
    /// Get the kind name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Relational => "relational",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    /// Accepts the configuration aliases, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" | "embedded" => Ok(Self::Embedded),
            "postgresql" | "postgres" | "pg" | "relational" => Ok(Self::Relational),
            "dynamodb" | "distributed" => Ok(Self::Distributed),
            other => Err(StorageError::validation(format!(
                "unsupported database type: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    /// Constructed, `initialize()` not yet run (or failed)
    Uninitialized,
    /// `initialize()` in progress
    Initializing,
    /// Serving requests
    Ready,
    /// `close()` in progress
    Closing,
    /// Closed; may be initialized again
    Closed,
}

impl StoreState {
    /// Get the state name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection pool utilization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections
    pub size: u32,
    /// Idle connections
    pub idle: u32,
    /// Connections in use
    pub active: u32,
    /// Configured maximum
    pub max: u32,
}

/// Result of a health query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Backend kind
    pub backend: BackendKind,
    /// Lifecycle state
    pub state: StoreState,
    /// True if the backend answered a round trip
    pub healthy: bool,
    /// Time since `initialize()` completed
    pub uptime_ms: Option<u64>,
    /// Mutations not yet durable
    pub pending_writes: usize,
    /// Pool utilization, where applicable
    pub pool: Option<PoolStatus>,
    /// Free-form detail (e.g. last error)
    pub detail: Option<String>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// Health report for a backend in `state`.
    #[must_use]
    pub fn new(backend: BackendKind, state: StoreState) -> Self {
        Self {
            backend,
            state,
            healthy: state == StoreState::Ready,
            uptime_ms: None,
            pending_writes: 0,
            pool: None,
            detail: None,
            checked_at: now_millis(),
        }
    }

    /// Set uptime.
    #[must_use]
    pub fn with_uptime(mut self, uptime: Option<Duration>) -> Self {
        self.uptime_ms = uptime.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Result of a performance-stats query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    /// Documents per collection
    pub record_counts: BTreeMap<Collection, usize>,
    /// `find_all` calls served
    pub query_count: u64,
    /// Query cache hits
    pub cache_hits: u64,
    /// Query cache misses
    pub cache_misses: u64,
    /// hits / (hits + misses), 0 when no queries ran
    pub cache_hit_rate: f64,
    /// Mean `find_all` latency
    pub average_query_ms: f64,
    /// Entries currently cached
    pub cache_entries: usize,
    /// Secondary indexes defined
    pub index_count: usize,
}

/// Per-collection summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// Documents in the collection
    pub total: usize,
    /// Created since midnight UTC
    pub created_today: usize,
    /// Created in the last seven days
    pub created_this_week: usize,
    /// Most recent `updatedAt`
    pub last_updated: Option<DateTime<Utc>>,
}

impl CollectionStats {
    /// Summarize documents relative to `now`.
    #[must_use]
    pub fn from_documents(docs: &[Document], now: DateTime<Utc>) -> Self {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or(now, |naive| naive.and_utc());
        let week_start = now - chrono::Duration::days(7);

        Self {
            total: docs.len(),
            created_today: docs.iter().filter(|d| d.created_at >= day_start).count(),
            created_this_week: docs.iter().filter(|d| d.created_at >= week_start).count(),
            last_updated: docs.iter().map(|d| d.updated_at).max(),
        }
    }
}

/// Snapshot of every collection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    /// Documents per collection
    #[serde(flatten)]
    pub collections: BTreeMap<Collection, Vec<Document>>,
    /// When the snapshot was taken
    pub exported_at: DateTime<Utc>,
    /// Export format version
    pub version: String,
}

// =============================================================================
// StorageBackend
// =============================================================================

/// Abstract storage backend.
///
/// `TigerStyle`: All operations are async and return explicit errors.
/// Operations other than `close` fail with `NotInitialized` unless the
/// backend is `Ready`.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Run setup. Failure is fatal: the backend stays unusable.
    async fn initialize(&self) -> StorageResult<()>;

    /// Documents matching `filter`, after sort/skip/limit.
    async fn find_all(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>>;

    /// Document by id, `None` if absent.
    async fn find_by_id(&self, collection: Collection, id: &str)
        -> StorageResult<Option<Document>>;

    /// Insert a document. Keeps a supplied id/createdAt, stamps the rest.
    ///
    /// Fails with `DuplicateKey` if the id exists.
    async fn create(&self, collection: Collection, fields: Fields) -> StorageResult<Document>;

    /// Shallow-merge `patch` into the document and refresh `updatedAt`.
    ///
    /// Fails with `NotFound` if the id is absent.
    async fn update(&self, collection: Collection, id: &str, patch: Fields)
        -> StorageResult<Document>;

    /// Remove and return the document. Fails with `NotFound` if absent.
    async fn delete(&self, collection: Collection, id: &str) -> StorageResult<Document>;

    /// Health/status query.
    async fn health(&self) -> StorageResult<HealthStatus>;

    /// Record counts, cache and latency statistics.
    async fn performance_stats(&self) -> StorageResult<PerformanceStats>;

    /// Release resources. Idempotent and safe from any state.
    async fn close(&self) -> StorageResult<()>;

    // -------------------------------------------------------------------------
    // Provided
    // -------------------------------------------------------------------------

    /// Documents matching `filter` in backend order.
    async fn find(&self, collection: Collection, filter: &Filter) -> StorageResult<Vec<Document>> {
        self.find_all(collection, filter, &FindOptions::default())
            .await
    }

    /// First document matching `filter`.
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> StorageResult<Option<Document>> {
        let options = FindOptions::new().with_limit(1);
        Ok(self
            .find_all(collection, filter, &options)
            .await?
            .into_iter()
            .next())
    }

    /// Number of documents matching `filter`.
    async fn count(&self, collection: Collection, filter: &Filter) -> StorageResult<usize> {
        Ok(self.find(collection, filter).await?.len())
    }

    /// Site settings as a flat field map (empty if none stored).
    async fn get_settings(&self) -> StorageResult<Fields> {
        let settings = self.find_one(Collection::Settings, &Filter::new()).await?;
        Ok(settings.map(|doc| doc.fields).unwrap_or_default())
    }

    /// Merge `patch` into the settings document, creating it if absent.
    async fn update_settings(&self, patch: Fields) -> StorageResult<Fields> {
        let existing = self.find_one(Collection::Settings, &Filter::new()).await?;
        let doc = match existing {
            Some(doc) => self.update(Collection::Settings, &doc.id, patch).await?,
            None => self.create(Collection::Settings, patch).await?,
        };
        Ok(doc.fields)
    }

    /// Histogram of a field's values; missing values count as `"unknown"`.
    async fn count_by_field(
        &self,
        collection: Collection,
        field: &str,
    ) -> StorageResult<BTreeMap<String, usize>> {
        let docs = self.find(collection, &Filter::new()).await?;
        let mut counts = BTreeMap::new();
        for doc in &docs {
            let key = match doc.get_field(field).as_deref() {
                None | Some(Value::Null) => "unknown".to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Totals and recency for one collection.
    async fn collection_stats(&self, collection: Collection) -> StorageResult<CollectionStats> {
        let docs = self.find(collection, &Filter::new()).await?;
        Ok(CollectionStats::from_documents(&docs, now_millis()))
    }

    /// Snapshot every collection.
    async fn export_data(&self) -> StorageResult<ExportData> {
        let mut collections = BTreeMap::new();
        for collection in Collection::all() {
            let docs = self.find(*collection, &Filter::new()).await?;
            collections.insert(*collection, docs);
        }
        Ok(ExportData {
            collections,
            exported_at: now_millis(),
            version: EXPORT_FORMAT_VERSION.to_string(),
        })
    }
}
