//! KeyValueClient - primitive operations of the managed key-value service.
//!
//! `TigerStyle`: The service boundary is a trait so the in-process client,
//! the retrying proxy and a deployment's network client are interchangeable.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Fields;
use crate::error::StorageResult;
use crate::query::Filter;

/// One stored item: a flat JSON object with an `id` attribute.
pub type Item = Fields;

/// Condition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `attribute_exists(<attr>)`
    AttributeExists(String),
    /// `attribute_not_exists(<attr>)`
    AttributeNotExists(String),
}

impl Condition {
    /// Condition requiring the item to exist.
    #[must_use]
    pub fn exists() -> Self {
        Self::AttributeExists(super::schema::PARTITION_KEY.to_string())
    }

    /// Condition requiring the item to be absent.
    #[must_use]
    pub fn not_exists() -> Self {
        Self::AttributeNotExists(super::schema::PARTITION_KEY.to_string())
    }

    /// Evaluate against the current item.
    #[must_use]
    pub fn holds(&self, current: Option<&Item>) -> bool {
        match self {
            Self::AttributeExists(attr) => current.is_some_and(|item| item.contains_key(attr)),
            Self::AttributeNotExists(attr) => !current.is_some_and(|item| item.contains_key(attr)),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttributeExists(attr) => write!(f, "attribute_exists({attr})"),
            Self::AttributeNotExists(attr) => write!(f, "attribute_not_exists({attr})"),
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    /// Table name
    pub name: String,
    /// Secondary index names
    pub indexes: Vec<String>,
    /// Approximate item count
    pub item_count: usize,
}

/// Secondary-index query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    /// Index name
    pub index: String,
    /// Partition key attribute
    pub partition_key: String,
    /// Required partition key value
    pub partition_value: Value,
    /// Filter applied to items read from the index
    pub filter: Filter,
    /// Resume after this id
    pub start_key: Option<String>,
}

/// One page of a scan or query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Items on this page (after the filter)
    pub items: Vec<Item>,
    /// Present when more pages remain
    pub last_evaluated_key: Option<String>,
}

/// Primitive operations of the key-value service.
///
/// Conditional writes whose condition does not hold fail with
/// `ConditionalCheckFailed`.
#[async_trait]
pub trait KeyValueClient: Send + Sync + fmt::Debug {
    /// Table metadata, `None` if the table does not exist.
    async fn describe_table(&self, table: &str) -> StorageResult<Option<TableDescription>>;

    /// Item by id.
    async fn get_item(&self, table: &str, id: &str) -> StorageResult<Option<Item>>;

    /// Write a whole item.
    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> StorageResult<()>;

    /// `SET` each attribute of `patch`; returns the item after the update.
    async fn update_item(
        &self,
        table: &str,
        id: &str,
        patch: Item,
        condition: Option<Condition>,
    ) -> StorageResult<Item>;

    /// Remove an item; returns the item before removal.
    async fn delete_item(
        &self,
        table: &str,
        id: &str,
        condition: Option<Condition>,
    ) -> StorageResult<Option<Item>>;

    /// Query a secondary index.
    async fn query_index(&self, table: &str, query: &IndexQuery) -> StorageResult<Page>;

    /// Full-table scan with a filter expression.
    async fn scan(
        &self,
        table: &str,
        filter: &Filter,
        start_key: Option<&str>,
    ) -> StorageResult<Page>;

    /// Put up to the per-request limit of items; returns unprocessed items.
    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StorageResult<Vec<Item>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_holds() {
        let mut item = Item::new();
        item.insert("id".into(), json!("a"));

        assert!(Condition::exists().holds(Some(&item)));
        assert!(!Condition::exists().holds(None));
        assert!(Condition::not_exists().holds(None));
        assert!(!Condition::not_exists().holds(Some(&item)));
    }

    #[test]
    fn test_condition_display() {
        assert_eq!(Condition::exists().to_string(), "attribute_exists(id)");
        assert_eq!(Condition::not_exists().to_string(), "attribute_not_exists(id)");
    }
}
