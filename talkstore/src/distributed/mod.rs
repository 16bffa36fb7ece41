//! DistributedStore - Managed Key-Value Backend
//!
//! `TigerStyle`: Conditional writes for consistency, retries at the client
//! boundary, no client-side locking.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    DistributedStore                    │
//! ├────────────────────────────────────────────────────────┤
//! │  RetryingClient ── RetryExecutor (backoff + jitter)    │
//! │        │                                               │
//! │        ▼                                               │
//! │  dyn KeyValueClient (DynamoDbClient, SimKeyValueClient) │
//! │  one table per collection, partition key `id`          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Queries with an equality predicate on an index partition key go to that
//! index; everything else is a paged full-table scan.
//!
//! A create whose first put landed but timed out is retried, fails its
//! condition, and is recognized by reading the item back. A delete in the
//! same situation reports `NotFound`.

mod client;
#[cfg(feature = "dynamodb")]
mod dynamodb;
mod retrying;
mod schema;
mod sim;

pub use client::{Condition, IndexQuery, Item, KeyValueClient, Page, TableDescription};
#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbClient;
pub use retrying::RetryingClient;
pub use schema::{indexes_for, plan_query, IndexSpec, QueryPlan, PARTITION_KEY};
pub use sim::SimKeyValueClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::backend::{BackendKind, HealthStatus, PerformanceStats, StorageBackend};
use crate::collection::Collection;
use crate::config::DistributedConfig;
use crate::document::{
    format_timestamp, is_reserved, now_millis, uuid_id, Document, Fields, FIELD_UPDATED_AT,
};
use crate::error::{StorageError, StorageResult};
use crate::lifecycle::{Lifecycle, QueryCounters};
use crate::query::{Filter, FindOptions};
use crate::retry::{BatchWriteReport, RetryExecutor};

// =============================================================================
// DistributedStore
// =============================================================================

/// Backend over a managed key-value service.
#[derive(Debug)]
pub struct DistributedStore {
    config: DistributedConfig,
    client: RetryingClient,
    lifecycle: Lifecycle,
    counters: QueryCounters,
}

impl DistributedStore {
    /// Store over `client`, retrying every primitive with `executor`.
    #[must_use]
    pub fn new(
        config: DistributedConfig,
        client: Arc<dyn KeyValueClient>,
        executor: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            config,
            client: RetryingClient::new(client, executor),
            lifecycle: Lifecycle::new(),
            counters: QueryCounters::default(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// The retrying client used for every call.
    #[must_use]
    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    /// Insert many documents in chunks of `batch_chunk_size`.
    ///
    /// Each chunk is retried on its own; a failing chunk leaves earlier
    /// chunks committed and reports how many items were written.
    ///
    /// # Errors
    /// `PartialBatch` when a chunk fails after retries.
    #[tracing::instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn batch_insert(
        &self,
        collection: Collection,
        inputs: Vec<Fields>,
    ) -> StorageResult<Vec<Document>> {
        self.lifecycle.ensure_ready()?;
        let now = now_millis();
        let docs = inputs
            .into_iter()
            .map(|fields| Document::from_input(fields, now, uuid_id))
            .collect::<StorageResult<Vec<_>>>()?;
        if docs.is_empty() {
            return Ok(docs);
        }

        let items = docs.iter().map(Document::to_item).collect();
        let table = self.config.table_name(collection);
        // The inner client: batch_write_with_retry runs its own retry loop.
        let report: BatchWriteReport = self
            .client
            .executor()
            .batch_write_with_retry(
                self.client.inner().as_ref(),
                &table,
                items,
                self.config.batch_chunk_size,
            )
            .await?;

        // Postcondition
        assert_eq!(report.items_written, docs.len(), "batch must write every item");
        Ok(docs)
    }

    async fn query_all(&self, table: &str, plan: QueryPlan) -> StorageResult<Vec<Item>> {
        let mut query = IndexQuery {
            index: plan.index.name.to_string(),
            partition_key: plan.index.partition_key.to_string(),
            partition_value: plan.partition_value,
            filter: plan.residual,
            start_key: None,
        };
        let mut items = Vec::new();
        loop {
            let page = self.client.query_index(table, &query).await?;
            items.extend(page.items);
            match page.last_evaluated_key {
                Some(key) => query.start_key = Some(key),
                None => return Ok(items),
            }
        }
    }

    async fn scan_all(&self, table: &str, filter: &Filter) -> StorageResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key: Option<String> = None;
        loop {
            let page = self
                .client
                .scan(table, filter, start_key.as_deref())
                .await?;
            items.extend(page.items);
            match page.last_evaluated_key {
                Some(key) => start_key = Some(key),
                None => return Ok(items),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for DistributedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    #[tracing::instrument(skip(self), fields(region = %self.config.region))]
    async fn initialize(&self) -> StorageResult<()> {
        if !self.lifecycle.begin_initialize()? {
            return Ok(());
        }

        for collection in Collection::all() {
            let table = self.config.table_name(*collection);
            let described = match self.client.describe_table(&table).await {
                Ok(described) => described,
                Err(e) => {
                    self.lifecycle.mark_failed();
                    tracing::error!(table = %table, error = %e, "failed to describe table");
                    return Err(e);
                }
            };
            if described.is_none() {
                self.lifecycle.mark_failed();
                tracing::error!(table = %table, "table does not exist");
                return Err(StorageError::permanent(format!(
                    "table {table} for collection {collection} does not exist"
                )));
            }
        }

        self.lifecycle.mark_ready();
        tracing::info!(tables = Collection::all().len(), "distributed store ready");
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
        let table = self.config.table_name(collection);

        let items = match plan_query(collection, filter) {
            Some(plan) => {
                tracing::debug!(table = %table, index = plan.index.name, "index query");
                self.query_all(&table, plan).await?
            }
            None => {
                tracing::debug!(table = %table, "full table scan");
                self.scan_all(&table, filter).await?
            }
        };
        let docs = items
            .into_iter()
            .map(Document::from_item)
            .collect::<StorageResult<Vec<_>>>()?;

        self.counters.record_query(started.elapsed());
        Ok(options.apply(docs))
    }

    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> StorageResult<Option<Document>> {
        self.lifecycle.ensure_ready()?;
        let table = self.config.table_name(collection);
        self.client
            .get_item(&table, id)
            .await?
            .map(Document::from_item)
            .transpose()
    }

    async fn create(&self, collection: Collection, fields: Fields) -> StorageResult<Document> {
        self.lifecycle.ensure_ready()?;
        let doc = Document::from_input(fields, now_millis(), uuid_id)?;
        let table = self.config.table_name(collection);

        let item = doc.to_item();
        match self
            .client
            .put_item(&table, item.clone(), Some(Condition::not_exists()))
            .await
        {
            Ok(()) => Ok(doc),
            Err(StorageError::ConditionalCheckFailed { .. }) => {
                // A retried put whose first attempt landed finds its own item.
                if self.client.get_item(&table, &doc.id).await?.as_ref() == Some(&item) {
                    tracing::debug!(table = %table, id = %doc.id, "earlier put attempt landed");
                    return Ok(doc);
                }
                Err(StorageError::duplicate_key(collection, doc.id))
            }
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Fields,
    ) -> StorageResult<Document> {
        self.lifecycle.ensure_ready()?;
        let table = self.config.table_name(collection);

        let mut item: Item = patch.into_iter().filter(|(k, _)| !is_reserved(k)).collect();
        item.insert(
            FIELD_UPDATED_AT.to_string(),
            Value::String(format_timestamp(&now_millis())),
        );

        match self
            .client
            .update_item(&table, id, item, Some(Condition::exists()))
            .await
        {
            Ok(updated) => Document::from_item(updated),
            Err(StorageError::ConditionalCheckFailed { .. }) => {
                Err(StorageError::not_found(collection, id))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> StorageResult<Document> {
        self.lifecycle.ensure_ready()?;
        let table = self.config.table_name(collection);

        match self
            .client
            .delete_item(&table, id, Some(Condition::exists()))
            .await
        {
            Ok(Some(old)) => Document::from_item(old),
            Ok(None) | Err(StorageError::ConditionalCheckFailed { .. }) => {
                Err(StorageError::not_found(collection, id))
            }
            Err(e) => Err(e),
        }
    }

    async fn health(&self) -> StorageResult<HealthStatus> {
        let state = self.lifecycle.state();
        let mut status = HealthStatus::new(self.kind(), state).with_uptime(self.lifecycle.uptime());
        if !status.healthy {
            return Ok(status);
        }

        let events_table = self.config.table_name(Collection::Events);
        match self.client.inner().describe_table(&events_table).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                status.healthy = false;
                status.detail = Some(format!("table {events_table} not found"));
            }
            Err(e) => {
                status.healthy = false;
                status.detail = Some(e.to_string());
            }
        }
        Ok(status)
    }

    async fn performance_stats(&self) -> StorageResult<PerformanceStats> {
        self.lifecycle.ensure_ready()?;
        let mut stats = PerformanceStats {
            query_count: self.counters.queries(),
            average_query_ms: self.counters.average_query_ms(),
            index_count: Collection::all()
                .iter()
                .map(|c| indexes_for(*c).len())
                .sum(),
            ..PerformanceStats::default()
        };
        for collection in Collection::all() {
            let table = self.config.table_name(*collection);
            let count = self
                .client
                .describe_table(&table)
                .await?
                .map_or(0, |d| d.item_count);
            stats.record_counts.insert(*collection, count);
        }
        Ok(stats)
    }

    async fn close(&self) -> StorageResult<()> {
        if self.lifecycle.begin_close() {
            self.counters.reset();
            tracing::info!("distributed store closed");
        }
        self.lifecycle.mark_closed();
        Ok(())
    }
}
