//! RetryingClient - proxy that routes every primitive through the
//! [`RetryExecutor`], so call sites never see transient failures.

use std::sync::Arc;

use async_trait::async_trait;

use super::client::{Condition, IndexQuery, Item, KeyValueClient, Page, TableDescription};
use crate::error::StorageResult;
use crate::query::Filter;
use crate::retry::RetryExecutor;

/// Key-value client wrapper adding retry with backoff to each call.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    inner: Arc<dyn KeyValueClient>,
    executor: Arc<RetryExecutor>,
}

impl RetryingClient {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn KeyValueClient>, executor: Arc<RetryExecutor>) -> Self {
        Self { inner, executor }
    }

    /// The unwrapped client (for callers that retry on their own terms).
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn KeyValueClient> {
        &self.inner
    }

    /// The executor applied to each call.
    #[must_use]
    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }
}

#[async_trait]
impl KeyValueClient for RetryingClient {
    async fn describe_table(&self, table: &str) -> StorageResult<Option<TableDescription>> {
        self.executor
            .execute("describe_table", || self.inner.describe_table(table))
            .await
    }

    async fn get_item(&self, table: &str, id: &str) -> StorageResult<Option<Item>> {
        self.executor
            .execute("get_item", || self.inner.get_item(table, id))
            .await
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> StorageResult<()> {
        self.executor
            .execute("put_item", || {
                self.inner.put_item(table, item.clone(), condition.clone())
            })
            .await
    }

    async fn update_item(
        &self,
        table: &str,
        id: &str,
        patch: Item,
        condition: Option<Condition>,
    ) -> StorageResult<Item> {
        self.executor
            .execute("update_item", || {
                self.inner
                    .update_item(table, id, patch.clone(), condition.clone())
            })
            .await
    }

    async fn delete_item(
        &self,
        table: &str,
        id: &str,
        condition: Option<Condition>,
    ) -> StorageResult<Option<Item>> {
        self.executor
            .execute("delete_item", || {
                self.inner.delete_item(table, id, condition.clone())
            })
            .await
    }

    async fn query_index(&self, table: &str, query: &IndexQuery) -> StorageResult<Page> {
        self.executor
            .execute("query_index", || self.inner.query_index(table, query))
            .await
    }

    async fn scan(
        &self,
        table: &str,
        filter: &Filter,
        start_key: Option<&str>,
    ) -> StorageResult<Page> {
        self.executor
            .execute("scan", || self.inner.scan(table, filter, start_key))
            .await
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StorageResult<Vec<Item>> {
        self.executor
            .execute("batch_write", || self.inner.batch_write(table, items.clone()))
            .await
    }
}
