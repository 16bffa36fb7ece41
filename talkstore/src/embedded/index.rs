//! HashIndex - maps the tuple of values of an ordered field set to the ids
//! of the documents carrying it.
//!
//! Numbers are normalized before hashing so `1` and `1.0` share a key.
//! Lookups return candidates only; callers re-check the filter.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::document::Document;
use crate::query::Filter;

#[derive(Debug, Clone)]
pub(crate) struct HashIndex {
    fields: Vec<String>,
    entries: HashMap<String, HashSet<String>>,
}

impl HashIndex {
    /// Build over `docs` with one scan.
    pub(crate) fn build<'a>(fields: Vec<String>, docs: impl Iterator<Item = &'a Document>) -> Self {
        // Precondition
        assert!(!fields.is_empty(), "index needs at least one field");

        let mut index = Self {
            fields,
            entries: HashMap::new(),
        };
        for doc in docs {
            index.insert(doc);
        }
        index
    }

    pub(crate) fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Same field set, ignoring order.
    pub(crate) fn has_field_set(&self, fields: &[String]) -> bool {
        let mine: HashSet<&str> = self.fields.iter().map(String::as_str).collect();
        let theirs: HashSet<&str> = fields.iter().map(String::as_str).collect();
        mine == theirs
    }

    /// Whether `filter` is a pure equality over exactly this field set.
    pub(crate) fn covers(&self, filter: &Filter) -> bool {
        if !filter.is_pure_equality() {
            return false;
        }
        let fields: Vec<String> = filter.fields().into_iter().map(str::to_string).collect();
        fields.len() == self.fields.len() && self.has_field_set(&fields)
    }

    pub(crate) fn insert(&mut self, doc: &Document) {
        let key = self.key_for_doc(doc);
        self.entries.entry(key).or_default().insert(doc.id.clone());
    }

    pub(crate) fn remove(&mut self, doc: &Document) {
        let key = self.key_for_doc(doc);
        if let Some(ids) = self.entries.get_mut(&key) {
            ids.remove(&doc.id);
            if ids.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Candidate ids for a covered filter.
    pub(crate) fn lookup(&self, filter: &Filter) -> Option<&HashSet<String>> {
        let values: Option<Vec<Value>> = self
            .fields
            .iter()
            .map(|f| filter.equality_on(f).map(normalize))
            .collect();
        let key = Value::Array(values?).to_string();
        self.entries.get(&key)
    }

    pub(crate) fn rebuild<'a>(&mut self, docs: impl Iterator<Item = &'a Document>) {
        self.entries.clear();
        for doc in docs {
            self.insert(doc);
        }
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.entries.len()
    }

    fn key_for_doc(&self, doc: &Document) -> String {
        let values: Vec<Value> = self
            .fields
            .iter()
            .map(|f| doc.get_field(f).map_or(Value::Null, |v| normalize(&v)))
            .collect();
        Value::Array(values).to_string()
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => n.as_f64().map_or_else(|| value.clone(), Value::from),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}
