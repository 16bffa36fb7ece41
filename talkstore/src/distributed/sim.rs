//! `SimKeyValueClient` - In-Process Key-Value Service
//!
//! `TigerStyle`: Deterministic testing with fault injection.
//!
//! Emulates the service semantics the store relies on: conditional writes,
//! secondary indexes ordered by sort key, paged scans with the filter applied
//! after the page is read, and the per-request batch limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::client::{Condition, IndexQuery, Item, KeyValueClient, Page, TableDescription};
use super::schema::{self, IndexSpec, PARTITION_KEY};
use crate::collection::Collection;
use crate::constants::{DISTRIBUTED_BATCH_ITEMS_COUNT_MAX, DISTRIBUTED_SIM_PAGE_ITEMS_COUNT};
use crate::dst::{FaultInjector, FaultType};
use crate::error::{StorageError, StorageResult};
use crate::query::{total_order, values_equal, Filter};

const WRITE_OPERATIONS: [&str; 3] = ["put_item", "update_item", "delete_item"];

/// Error for a write that was applied but whose response was lost.
fn lost_response(fault: Option<FaultType>, operation: &str) -> StorageResult<()> {
    match fault {
        Some(FaultType::KvResponseLost) => Err(FaultType::KvResponseLost.to_error(operation)),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct SimTable {
    indexes: Vec<IndexSpec>,
    items: IndexMap<String, Item>,
}

/// In-memory key-value service for tests and local runs.
#[derive(Debug)]
pub struct SimKeyValueClient {
    tables: RwLock<HashMap<String, SimTable>>,
    faults: Arc<FaultInjector>,
    page_size: usize,
    calls: Mutex<Vec<String>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl Default for SimKeyValueClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKeyValueClient {
    /// Client with no tables and no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fault_injector(Arc::new(FaultInjector::disabled()))
    }

    /// Client sharing a fault injector with the test harness.
    #[must_use]
    pub fn with_fault_injector(faults: Arc<FaultInjector>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            faults,
            page_size: DISTRIBUTED_SIM_PAGE_ITEMS_COUNT,
            calls: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Set the scan/query page size.
    ///
    /// # Panics
    /// Panics if `page_size` is zero.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        // Precondition
        assert!(page_size > 0, "page_size must be positive");
        self.page_size = page_size;
        self
    }

    /// Create a table with the given indexes (no-op if it exists).
    pub fn create_table(&self, name: impl Into<String>, indexes: &[IndexSpec]) {
        self.tables
            .write()
            .entry(name.into())
            .or_insert_with(|| SimTable {
                indexes: indexes.to_vec(),
                items: IndexMap::new(),
            });
    }

    /// Create the table of every collection using `table_name`.
    pub fn provision(&self, table_name: impl Fn(Collection) -> String) {
        for collection in Collection::all() {
            self.create_table(table_name(*collection), schema::indexes_for(*collection));
        }
    }

    /// Drop a table.
    pub fn drop_table(&self, name: &str) {
        self.tables.write().remove(name);
    }

    /// Operation names in call order (e.g. `put_item`).
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of calls of one operation.
    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == operation).count()
    }

    /// Item counts of successful batch writes, in order.
    #[must_use]
    pub fn batch_write_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Items currently stored in `table`.
    #[must_use]
    pub fn item_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.items.len())
    }

    /// Record the call and roll for an injected fault.
    ///
    /// Faults that let the request through (partial batches, lost write
    /// responses) are returned for the operation to act on.
    fn enter(&self, operation: &str) -> StorageResult<Option<FaultType>> {
        self.calls.lock().push(operation.to_string());
        match self.faults.should_inject(&format!("kv_{operation}")) {
            Some(FaultType::KvUnprocessedItems) => Ok(Some(FaultType::KvUnprocessedItems)),
            Some(FaultType::KvResponseLost) if WRITE_OPERATIONS.contains(&operation) => {
                Ok(Some(FaultType::KvResponseLost))
            }
            Some(fault) => Err(fault.to_error(operation)),
            None => Ok(None),
        }
    }

    fn missing_table(table: &str) -> StorageError {
        StorageError::permanent(format!("ResourceNotFoundException: table {table} not found"))
    }

    fn item_id(item: &Item) -> StorageResult<String> {
        match item.get(PARTITION_KEY) {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            _ => Err(StorageError::validation(
                "item is missing a string partition key 'id'",
            )),
        }
    }

    fn check(condition: Option<&Condition>, current: Option<&Item>) -> StorageResult<()> {
        match condition {
            Some(condition) if !condition.holds(current) => Err(
                StorageError::conditional_check_failed(condition.to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Read up to a page of `candidates` after `start_key`, then filter.
    fn page<'a>(
        &self,
        candidates: impl Iterator<Item = &'a Item>,
        filter: &Filter,
        start_key: Option<&str>,
    ) -> Page {
        let mut candidates = candidates.peekable();
        if let Some(start) = start_key {
            for item in candidates.by_ref() {
                if item.get(PARTITION_KEY).and_then(Value::as_str) == Some(start) {
                    break;
                }
            }
        }

        let mut page = Page::default();
        let mut last_id = None;
        for item in candidates.by_ref().take(self.page_size) {
            last_id = item
                .get(PARTITION_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            if filter.matches_item(item) {
                page.items.push(item.clone());
            }
        }
        if candidates.peek().is_some() {
            page.last_evaluated_key = last_id;
        }
        page
    }
}

#[async_trait]
impl KeyValueClient for SimKeyValueClient {
    async fn describe_table(&self, table: &str) -> StorageResult<Option<TableDescription>> {
        self.enter("describe_table")?;
        Ok(self.tables.read().get(table).map(|t| TableDescription {
            name: table.to_string(),
            indexes: t.indexes.iter().map(|i| i.name.to_string()).collect(),
            item_count: t.items.len(),
        }))
    }

    async fn get_item(&self, table: &str, id: &str) -> StorageResult<Option<Item>> {
        self.enter("get_item")?;
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing_table(table))?;
        Ok(t.items.get(id).cloned())
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> StorageResult<()> {
        let fault = self.enter("put_item")?;
        let id = Self::item_id(&item)?;
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        Self::check(condition.as_ref(), t.items.get(&id))?;
        t.items.insert(id, item);
        lost_response(fault, "put_item")
    }

    async fn update_item(
        &self,
        table: &str,
        id: &str,
        patch: Item,
        condition: Option<Condition>,
    ) -> StorageResult<Item> {
        let fault = self.enter("update_item")?;
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        Self::check(condition.as_ref(), t.items.get(id))?;

        let item = t.items.entry(id.to_string()).or_insert_with(|| {
            let mut fresh = Item::new();
            fresh.insert(PARTITION_KEY.to_string(), Value::String(id.to_string()));
            fresh
        });
        for (key, value) in patch {
            if key != PARTITION_KEY {
                item.insert(key, value);
            }
        }
        let updated = item.clone();
        lost_response(fault, "update_item")?;
        Ok(updated)
    }

    async fn delete_item(
        &self,
        table: &str,
        id: &str,
        condition: Option<Condition>,
    ) -> StorageResult<Option<Item>> {
        let fault = self.enter("delete_item")?;
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        Self::check(condition.as_ref(), t.items.get(id))?;
        let removed = t.items.shift_remove(id);
        lost_response(fault, "delete_item")?;
        Ok(removed)
    }

    async fn query_index(&self, table: &str, query: &IndexQuery) -> StorageResult<Page> {
        self.enter("query_index")?;
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing_table(table))?;
        let index = t
            .indexes
            .iter()
            .find(|i| i.name == query.index)
            .ok_or_else(|| {
                StorageError::validation(format!(
                    "table {table} has no index named {}",
                    query.index
                ))
            })?;

        let mut matching: Vec<&Item> = t
            .items
            .values()
            .filter(|item| {
                item.get(index.partition_key)
                    .is_some_and(|v| values_equal(v, &query.partition_value))
            })
            .collect();
        if let Some(sort_key) = index.sort_key {
            matching.sort_by(|a, b| total_order(a.get(sort_key), b.get(sort_key)));
        }

        Ok(self.page(
            matching.into_iter(),
            &query.filter,
            query.start_key.as_deref(),
        ))
    }

    async fn scan(
        &self,
        table: &str,
        filter: &Filter,
        start_key: Option<&str>,
    ) -> StorageResult<Page> {
        self.enter("scan")?;
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing_table(table))?;
        Ok(self.page(t.items.values(), filter, start_key))
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StorageResult<Vec<Item>> {
        let fault = self.enter("batch_write")?;
        if items.len() > DISTRIBUTED_BATCH_ITEMS_COUNT_MAX {
            return Err(StorageError::validation(format!(
                "batch of {} items exceeds the limit of {DISTRIBUTED_BATCH_ITEMS_COUNT_MAX}",
                items.len()
            )));
        }

        let mut items = items;
        // An injected partial write accepts the first half and hands back the rest.
        let unprocessed = if fault == Some(FaultType::KvUnprocessedItems) && items.len() > 1 {
            items.split_off(items.len() / 2)
        } else {
            Vec::new()
        };

        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        for item in &items {
            Self::item_id(item)?;
        }
        for item in items.iter().cloned() {
            let id = Self::item_id(&item)?;
            t.items.insert(id, item);
        }
        self.batch_sizes.lock().push(items.len());
        Ok(unprocessed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dst::{DeterministicRng, FaultConfig, FaultInjectorBuilder};
    use serde_json::json;

    fn item(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn client_with_events() -> SimKeyValueClient {
        let client = SimKeyValueClient::new().with_page_size(2);
        client.create_table("events", schema::indexes_for(Collection::Events));
        client
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let client = client_with_events();
        let e = item(json!({"id": "a", "status": "upcoming"}));

        client
            .put_item("events", e.clone(), Some(Condition::not_exists()))
            .await
            .unwrap();
        let err = client
            .put_item("events", e, Some(Condition::not_exists()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionalCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_update_requires_existing_item() {
        let client = client_with_events();
        let err = client
            .update_item("events", "nope", Item::new(), Some(Condition::exists()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionalCheckFailed { .. }));
        assert_eq!(client.item_count("events"), 0);
    }

    #[tokio::test]
    async fn test_scan_pages_through_everything() {
        let client = client_with_events();
        for i in 0..5 {
            client
                .put_item("events", item(json!({"id": format!("e{i}"), "n": i})), None)
                .await
                .unwrap();
        }

        let filter = Filter::new().gte("n", 1);
        let mut seen = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let page = client
                .scan("events", &filter, start.as_deref())
                .await
                .unwrap();
            seen.extend(page.items);
            match page.last_evaluated_key {
                Some(key) => start = Some(key),
                None => break,
            }
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(client.call_count("scan"), 3);
    }

    #[tokio::test]
    async fn test_query_index_orders_by_sort_key() {
        let client = client_with_events();
        for (id, status, date) in [
            ("a", "upcoming", "2025-01-03"),
            ("b", "completed", "2025-01-01"),
            ("c", "upcoming", "2025-01-01"),
        ] {
            client
                .put_item(
                    "events",
                    item(json!({"id": id, "status": status, "date": date})),
                    None,
                )
                .await
                .unwrap();
        }

        let page = client
            .query_index(
                "events",
                &IndexQuery {
                    index: "date-index".into(),
                    partition_key: "status".into(),
                    partition_value: json!("upcoming"),
                    filter: Filter::new(),
                    start_key: None,
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("a")]);
    }

    #[tokio::test]
    async fn test_batch_limit_enforced() {
        let client = client_with_events();
        let items = (0..26).map(|i| item(json!({"id": i.to_string()}))).collect();
        let err = client.batch_write("events", items).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));
        assert!(client.batch_write_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let faults = FaultInjectorBuilder::new(DeterministicRng::new(42))
            .with_fault(
                FaultConfig::new(FaultType::KvThrottled, 1.0)
                    .with_filter("get_item")
                    .with_max_injections(1),
            )
            .with_fault(FaultConfig::new(FaultType::KvUnprocessedItems, 1.0).with_filter("batch"))
            .build();
        let client = SimKeyValueClient::with_fault_injector(Arc::new(faults));
        client.create_table("events", &[]);

        let err = client.get_item("events", "a").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(client.get_item("events", "a").await.unwrap().is_none());

        let items = (0..4).map(|i| item(json!({"id": i.to_string()}))).collect();
        let unprocessed = client.batch_write("events", items).await.unwrap();
        assert_eq!(unprocessed.len(), 2);
        assert_eq!(client.item_count("events"), 2);
    }

    #[tokio::test]
    async fn test_missing_table() {
        let client = SimKeyValueClient::new();
        assert!(client.describe_table("ghost").await.unwrap().is_none());
        assert!(matches!(
            client.get_item("ghost", "a").await,
            Err(StorageError::Permanent { .. })
        ));
    }
}
