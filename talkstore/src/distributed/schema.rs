//! Remote table layout: one table per collection keyed by `id`, plus the
//! secondary indexes for status/date and event-scoped queries.

use serde_json::Value;

use crate::collection::Collection;
use crate::query::Filter;

/// Primary key attribute of every table.
pub const PARTITION_KEY: &str = "id";

/// A global secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name
    pub name: &'static str,
    /// Partition key attribute
    pub partition_key: &'static str,
    /// Sort key attribute
    pub sort_key: Option<&'static str>,
}

const EVENTS_INDEXES: &[IndexSpec] = &[IndexSpec {
    name: "date-index",
    partition_key: "status",
    sort_key: Some("date"),
}];

const EVENT_SCOPED_INDEXES: &[IndexSpec] = &[IndexSpec {
    name: "event-index",
    partition_key: "eventId",
    sort_key: Some("createdAt"),
}];

/// Secondary indexes defined on a collection's table.
#[must_use]
pub fn indexes_for(collection: Collection) -> &'static [IndexSpec] {
    match collection {
        Collection::Events => EVENTS_INDEXES,
        Collection::Participants | Collection::Talks => EVENT_SCOPED_INDEXES,
        Collection::Users | Collection::Settings | Collection::Analytics => &[],
    }
}

/// Index query chosen for a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Index to query
    pub index: IndexSpec,
    /// Equality value for the partition key
    pub partition_value: Value,
    /// Predicates left to apply to returned items
    pub residual: Filter,
}

/// Pick an index whose partition key has an equality predicate.
///
/// `None` means the caller falls back to a full-table scan.
#[must_use]
pub fn plan_query(collection: Collection, filter: &Filter) -> Option<QueryPlan> {
    indexes_for(collection).iter().find_map(|index| {
        filter
            .equality_on(index.partition_key)
            .map(|value| QueryPlan {
                index: *index,
                partition_value: value.clone(),
                residual: filter.without(index.partition_key),
            })
    })
}
