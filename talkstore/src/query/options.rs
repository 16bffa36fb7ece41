//! FindOptions - sort, skip and limit.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// Field to sort on
    pub field: String,
    /// Direction
    pub order: SortOrder,
}

/// Query options applied after filtering, in order: sort, skip, limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FindOptions {
    /// Sort keys, most significant first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,
    /// Results to skip
    #[serde(default)]
    pub skip: usize,
    /// Maximum results to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Default options (insertion order, no paging).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sort key.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    /// Skip the first `skip` results.
    #[must_use]
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Return at most `limit` results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if no sort, skip or limit is set.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.sort.is_empty() && self.skip == 0 && self.limit.is_none()
    }

    /// Stable multi-key sort, then skip, then limit.
    #[must_use]
    pub fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if !self.sort.is_empty() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
        let limit = self.limit.unwrap_or(usize::MAX);
        docs.into_iter().skip(self.skip).take(limit).collect()
    }

    /// Compare two documents by the sort keys.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for key in &self.sort {
            let left = a.get_field(&key.field);
            let right = b.get_field(&key.field);
            let ordering = total_order(left.as_deref(), right.as_deref());
            let ordering = match key.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Canonical string form used as a cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Rank of a JSON type in sort order: missing < null < bool < number < string < array < object.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order over optional JSON values for sorting.
pub(crate) fn total_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ordering = total_order(Some(l), Some(r));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::now_millis;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> Document {
        let Value::Object(mut fields) = value else {
            panic!("expected object")
        };
        fields.insert("id".into(), json!(id));
        Document::from_input(fields, now_millis(), String::new).unwrap()
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_default_keeps_order() {
        let docs = vec![doc("b", json!({})), doc("a", json!({}))];
        let out = FindOptions::new().apply(docs);
        assert_eq!(ids(&out), vec!["b", "a"]);
    }

    #[test]
    fn test_multi_key_stable_sort() {
        let docs = vec![
            doc("1", json!({"status": "upcoming", "date": "2025-01-03"})),
            doc("2", json!({"status": "completed", "date": "2025-01-01"})),
            doc("3", json!({"status": "upcoming", "date": "2025-01-01"})),
            doc("4", json!({"status": "upcoming", "date": "2025-01-01"})),
        ];
        let out = FindOptions::new()
            .sort_by("status", SortOrder::Desc)
            .sort_by("date", SortOrder::Asc)
            .apply(docs);
        assert_eq!(ids(&out), vec!["3", "4", "1", "2"]);
    }

    #[test]
    fn test_skip_then_limit() {
        let docs = (0..10)
            .map(|i| doc(&i.to_string(), json!({"n": i})))
            .collect();
        let out = FindOptions::new()
            .sort_by("n", SortOrder::Desc)
            .with_skip(2)
            .with_limit(3)
            .apply(docs);
        assert_eq!(ids(&out), vec!["7", "6", "5"]);
    }

    #[test]
    fn test_missing_sorts_first() {
        let docs = vec![doc("has", json!({"n": 1})), doc("missing", json!({}))];
        let out = FindOptions::new().sort_by("n", SortOrder::Asc).apply(docs);
        assert_eq!(ids(&out), vec!["missing", "has"]);
    }

    #[test]
    fn test_cache_key_distinguishes_options() {
        let a = FindOptions::new().with_limit(1);
        let b = FindOptions::new().with_limit(2);
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(FindOptions::new().cache_key(), "{\"skip\":0}");
    }
}
