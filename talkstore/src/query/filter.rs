//! Filter - conjunctive field predicates.
//!
//! A filter is an AND of per-field predicates. Each predicate is one or more
//! operator clauses; a bare value means equality.
//!
//! ```rust
//! use serde_json::json;
//! use talkstore::query::Filter;
//!
//! let built = Filter::new().eq("status", "upcoming").gte("date", "2025-01-02");
//! let parsed = Filter::from_json(&json!({
//!     "status": "upcoming",
//!     "date": { "$gte": "2025-01-02" }
//! })).unwrap();
//! assert_eq!(built, parsed);
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::document::Document;
use crate::error::{StorageError, StorageResult};

// =============================================================================
// Operator
// =============================================================================

/// Comparison operator of a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Equal (`$eq`, or a bare value)
    Eq,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Not equal; a missing field satisfies it
    Ne,
    /// Value is one of the operand array
    In,
    /// Value is none of the operand array; a missing field satisfies it
    Nin,
}

impl Operator {
    /// Every supported operator.
    pub const ALL: [Operator; 8] = [
        Self::Eq,
        Self::Gte,
        Self::Lte,
        Self::Gt,
        Self::Lt,
        Self::Ne,
        Self::In,
        Self::Nin,
    ];

    /// Operator token, e.g. `$gte`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Gte => "$gte",
            Self::Lte => "$lte",
            Self::Gt => "$gt",
            Self::Lt => "$lt",
            Self::Ne => "$ne",
            Self::In => "$in",
            Self::Nin => "$nin",
        }
    }

    /// Parse an operator token.
    ///
    /// # Errors
    /// Returns `Validation` for unknown operators.
    pub fn parse(token: &str) -> StorageResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == token)
            .ok_or_else(|| StorageError::validation(format!("unsupported filter operator: {token}")))
    }

    /// Evaluate this operator against a field value (`None` = field missing).
    #[must_use]
    pub fn evaluate(&self, actual: Option<&Value>, operand: &Value) -> bool {
        match self {
            Self::Eq => actual.is_some_and(|a| values_equal(a, operand)),
            Self::Ne => actual.map_or(true, |a| !values_equal(a, operand)),
            Self::Gt => compare(actual, operand) == Some(Ordering::Greater),
            Self::Gte => matches!(
                compare(actual, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt => compare(actual, operand) == Some(Ordering::Less),
            Self::Lte => matches!(
                compare(actual, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In => match (actual, operand) {
                (Some(a), Value::Array(options)) => options.iter().any(|o| values_equal(a, o)),
                _ => false,
            },
            Self::Nin => match (actual, operand) {
                (None, Value::Array(_)) => true,
                (Some(a), Value::Array(options)) => !options.iter().any(|o| values_equal(a, o)),
                _ => false,
            },
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operator applied to one operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Operator
    pub op: Operator,
    /// Right-hand side
    pub operand: Value,
}

// =============================================================================
// Filter
// =============================================================================

/// Conjunction of field predicates. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: BTreeMap<String, Vec<Clause>>,
}

impl Filter {
    /// Empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a clause on `field`.
    #[must_use]
    pub fn with_clause(mut self, field: impl Into<String>, op: Operator, operand: impl Into<Value>) -> Self {
        self.predicates.entry(field.into()).or_default().push(Clause {
            op,
            operand: operand.into(),
        });
        self
    }

    /// `field == value`
    #[must_use]
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_clause(field, Operator::Eq, value)
    }

    /// `field != value`
    #[must_use]
    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_clause(field, Operator::Ne, value)
    }

    /// `field > value`
    #[must_use]
    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_clause(field, Operator::Gt, value)
    }

    /// `field >= value`
    #[must_use]
    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_clause(field, Operator::Gte, value)
    }

    /// `field < value`
    #[must_use]
    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_clause(field, Operator::Lt, value)
    }

    /// `field <= value`
    #[must_use]
    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_clause(field, Operator::Lte, value)
    }

    /// `field` is one of `values`
    #[must_use]
    pub fn is_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with_clause(field, Operator::In, Value::Array(values))
    }

    /// `field` is none of `values`
    #[must_use]
    pub fn not_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with_clause(field, Operator::Nin, Value::Array(values))
    }

    /// Parse the JSON form: `{"field": value}` or `{"field": {"$op": value}}`.
    ///
    /// # Errors
    /// Returns `Validation` if the filter is not an object, mixes operator and
    /// plain keys, or uses an unknown operator.
    pub fn from_json(value: &Value) -> StorageResult<Self> {
        let Value::Object(fields) = value else {
            return Err(StorageError::validation(format!(
                "filter must be a JSON object, got {value}"
            )));
        };

        let mut filter = Self::new();
        for (field, spec) in fields {
            let operators = match spec {
                Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
                _ => {
                    filter = filter.eq(field.clone(), spec.clone());
                    continue;
                }
            };
            for (token, operand) in operators {
                if !token.starts_with('$') {
                    return Err(StorageError::validation(format!(
                        "filter on '{field}' mixes operators with plain key '{token}'"
                    )));
                }
                filter = filter.with_clause(field.clone(), Operator::parse(token)?, operand.clone());
            }
        }
        Ok(filter)
    }

    /// True if the filter has no predicates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Iterate `(field, clauses)` in field order.
    pub fn predicates(&self) -> impl Iterator<Item = (&str, &[Clause])> {
        self.predicates
            .iter()
            .map(|(field, clauses)| (field.as_str(), clauses.as_slice()))
    }

    /// Sorted field names referenced by the filter.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.predicates.keys().map(String::as_str).collect()
    }

    /// Operand of the single equality clause on `field`, if that is the
    /// only clause on it.
    #[must_use]
    pub fn equality_on(&self, field: &str) -> Option<&Value> {
        match self.predicates.get(field)?.as_slice() {
            [Clause {
                op: Operator::Eq,
                operand,
            }] => Some(operand),
            _ => None,
        }
    }

    /// True if every predicate is exactly one equality clause.
    #[must_use]
    pub fn is_pure_equality(&self) -> bool {
        !self.is_empty()
            && self
                .predicates
                .keys()
                .all(|field| self.equality_on(field).is_some())
    }

    /// Filter without the predicate on `field`.
    #[must_use]
    pub fn without(&self, field: &str) -> Self {
        let mut rest = self.clone();
        rest.predicates.remove(field);
        rest
    }

    /// Evaluate against a document.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.predicates.iter().all(|(field, clauses)| {
            let actual = doc.get_field(field);
            clauses
                .iter()
                .all(|clause| clause.op.evaluate(actual.as_deref(), &clause.operand))
        })
    }

    /// Evaluate against a flat JSON item (id and timestamps as plain fields).
    #[must_use]
    pub fn matches_item(&self, item: &serde_json::Map<String, Value>) -> bool {
        self.predicates.iter().all(|(field, clauses)| {
            let actual = item.get(field);
            clauses
                .iter()
                .all(|clause| clause.op.evaluate(actual, &clause.operand))
        })
    }

    /// Canonical, injective string form used as a cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let encoded: Vec<Value> = self
            .predicates
            .iter()
            .map(|(field, clauses)| {
                let clauses: Vec<Value> = clauses
                    .iter()
                    .map(|c| Value::Array(vec![Value::from(c.op.as_str()), c.operand.clone()]))
                    .collect();
                Value::Array(vec![Value::from(field.as_str()), Value::Array(clauses)])
            })
            .collect();
        Value::Array(encoded).to_string()
    }
}

// =============================================================================
// Value Semantics
// =============================================================================

/// Equality with numeric coercion (`1 == 1.0`).
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two present values of the same scalar type.
///
/// Mixed types, arrays and objects are incomparable.
fn compare(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (actual?, operand) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{now_millis, Fields};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        let Value::Object(fields) = value else {
            panic!("expected object")
        };
        Document::from_input(fields, now_millis(), || "doc".to_string()).unwrap()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&doc(json!({}))));
        assert!(Filter::new().matches(&doc(json!({"a": 1}))));
    }

    #[test]
    fn test_equality_and_conjunction() {
        let d = doc(json!({"status": "upcoming", "capacity": 50}));
        assert!(Filter::new().eq("status", "upcoming").matches(&d));
        assert!(Filter::new()
            .eq("status", "upcoming")
            .eq("capacity", 50.0)
            .matches(&d));
        assert!(!Filter::new()
            .eq("status", "upcoming")
            .eq("capacity", 51)
            .matches(&d));
    }

    #[test]
    fn test_range_operators() {
        let d = doc(json!({"date": "2025-01-02", "n": 5}));
        assert!(Filter::new().gte("date", "2025-01-02").matches(&d));
        assert!(!Filter::new().gt("date", "2025-01-02").matches(&d));
        assert!(Filter::new().lt("n", 6).lte("n", 5).matches(&d));
        assert!(!Filter::new().lt("n", 5).matches(&d));
    }

    #[test]
    fn test_mixed_types_never_compare() {
        let d = doc(json!({"n": "5"}));
        assert!(!Filter::new().gt("n", 1).matches(&d));
        assert!(!Filter::new().lte("n", 10).matches(&d));
    }

    #[test]
    fn test_missing_field_semantics() {
        let d = doc(json!({}));
        assert!(!Filter::new().eq("x", Value::Null).matches(&d));
        assert!(!Filter::new().gt("x", 0).matches(&d));
        assert!(!Filter::new().is_in("x", vec![json!(1)]).matches(&d));
        assert!(Filter::new().ne("x", 1).matches(&d));
        assert!(Filter::new().not_in("x", vec![json!(1)]).matches(&d));
    }

    #[test]
    fn test_in_and_nin() {
        let d = doc(json!({"category": "tech"}));
        assert!(Filter::new()
            .is_in("category", vec![json!("tech"), json!("food")])
            .matches(&d));
        assert!(!Filter::new()
            .not_in("category", vec![json!("tech")])
            .matches(&d));
        // Non-array operands never match.
        assert!(!Filter::new()
            .with_clause("category", Operator::In, "tech")
            .matches(&d));
        assert!(!Filter::new()
            .with_clause("category", Operator::Nin, "food")
            .matches(&d));
    }

    #[test]
    fn test_identity_fields_are_filterable() {
        let d = doc(json!({"id": "evt-7"}));
        assert!(Filter::new().eq("id", "evt-7").matches(&d));
        assert!(Filter::new()
            .gte("createdAt", "2000-01-01T00:00:00.000Z")
            .matches(&d));
    }

    #[test]
    fn test_from_json() {
        let filter = Filter::from_json(&json!({
            "status": "upcoming",
            "date": {"$gte": "2025-01-01", "$lt": "2025-02-01"},
            "meta": {"room": "A"}
        }))
        .unwrap();

        assert_eq!(filter.equality_on("status"), Some(&json!("upcoming")));
        assert_eq!(filter.equality_on("meta"), Some(&json!({"room": "A"})));
        assert!(filter.equality_on("date").is_none());
        assert!(!filter.is_pure_equality());
        assert_eq!(filter.fields(), vec!["date", "meta", "status"]);
    }

    #[test]
    fn test_from_json_rejects_unknown_operator() {
        let err = Filter::from_json(&json!({"n": {"$regex": "a.*"}})).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));

        let err = Filter::from_json(&json!({"n": {"$gt": 1, "plain": 2}})).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));

        assert!(Filter::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_cache_key_is_canonical() {
        let a = Filter::new().eq("b", 1).eq("a", 2);
        let b = Filter::new().eq("a", 2).eq("b", 1);
        assert_eq!(a.cache_key(), b.cache_key());

        let repeated = Filter::new().gte("n", 1).gte("n", 5);
        let single = Filter::new().gte("n", 5);
        assert_ne!(repeated.cache_key(), single.cache_key());
    }

    #[test]
    fn test_matches_item() {
        let mut item = Fields::new();
        item.insert("eventId".into(), json!("e1"));
        assert!(Filter::new().eq("eventId", "e1").matches_item(&item));
        assert!(!Filter::new().eq("eventId", "e2").matches_item(&item));
    }
}
