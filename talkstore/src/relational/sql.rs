//! SQL statement builder for the relational schema.
//!
//! `TigerStyle`: Every value, including field names, is a bound parameter.
//! Only quoted table identifiers are spliced into the text.
//!
//! Documents live in `(seq, id, data JSONB, created_at, updated_at)` rows.
//! Filters translate to JSONB predicates with type guards so that
//! comparisons across JSON types are false, matching in-memory evaluation.
//! Timestamp columns are filtered through their serialized form
//! (`2025-01-01T00:00:00.000Z`), compared bytewise like the other backends.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::document::{Document, Fields, FIELD_CREATED_AT, FIELD_ID, FIELD_UPDATED_AT};
use crate::query::{Filter, FindOptions, Operator, SortOrder};

/// Column list returned by every document query.
pub const DOCUMENT_COLUMNS: &str = "id, data, created_at, updated_at";

/// A bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// `TEXT`
    Text(String),
    /// `JSONB`
    Json(Value),
    /// `BIGINT`
    Int(i64),
    /// `TIMESTAMPTZ`
    Timestamp(DateTime<Utc>),
}

/// SQL text plus its parameters in `$n` order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    /// Statement text with `$1..$n` placeholders
    pub sql: String,
    /// Parameters
    pub params: Vec<SqlParam>,
}

/// Quote an identifier for interpolation.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Default)]
struct Binder {
    params: Vec<SqlParam>,
}

impl Binder {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn text(&mut self, value: &str) -> String {
        format!("{}::text", self.bind(SqlParam::Text(value.to_string())))
    }

    fn json(&mut self, value: &Value) -> String {
        format!("{}::jsonb", self.bind(SqlParam::Json(value.clone())))
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
        }
    }
}

// =============================================================================
// Filter Translation
// =============================================================================

/// Column-backed fields: `id` and the timestamps.
#[derive(Debug, Clone, Copy)]
enum Column {
    Id,
    CreatedAt,
    UpdatedAt,
}

impl Column {
    fn for_field(field: &str) -> Option<Self> {
        match field {
            FIELD_ID => Some(Self::Id),
            FIELD_CREATED_AT => Some(Self::CreatedAt),
            FIELD_UPDATED_AT => Some(Self::UpdatedAt),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }

    /// Text expression filters compare against.
    fn filter_expr(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::CreatedAt => {
                "(to_char(created_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"') COLLATE \"C\")"
            }
            Self::UpdatedAt => {
                "(to_char(updated_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"') COLLATE \"C\")"
            }
        }
    }

    /// Bind a string operand as text; `None` for any other JSON type.
    fn bind(binder: &mut Binder, operand: &Value) -> Option<String> {
        match operand {
            Value::String(raw) => Some(binder.bind(SqlParam::Text(raw.clone()))),
            _ => None,
        }
    }
}

fn comparison(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Lt => "<",
        Operator::Lte => "<=",
        Operator::In | Operator::Nin => "IN",
    }
}

fn json_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(_) => Some("string"),
        Value::Number(_) => Some("number"),
        Value::Bool(_) => Some("boolean"),
        _ => None,
    }
}

fn column_predicate(binder: &mut Binder, column: Column, op: Operator, operand: &Value) -> String {
    let name = column.filter_expr();
    match op {
        Operator::In | Operator::Nin => {
            let Value::Array(options) = operand else {
                return "FALSE".to_string();
            };
            let alternatives: Vec<String> = options
                .iter()
                .filter_map(|o| Column::bind(binder, o))
                .map(|p| format!("{name} = {p}"))
                .collect();
            let any = if alternatives.is_empty() {
                "FALSE".to_string()
            } else {
                format!("({})", alternatives.join(" OR "))
            };
            if op == Operator::In {
                any
            } else {
                format!("NOT {any}")
            }
        }
        _ => match Column::bind(binder, operand) {
            Some(p) => format!("{name} {} {p}", comparison(op)),
            // Columns are never missing, so only $ne holds across types.
            None if op == Operator::Ne => "TRUE".to_string(),
            None => "FALSE".to_string(),
        },
    }
}

fn data_predicate(binder: &mut Binder, field: &str, op: Operator, operand: &Value) -> String {
    let guard = match op {
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => match json_type(operand) {
            Some(kind) => Some(kind),
            None => return "FALSE".to_string(),
        },
        Operator::In | Operator::Nin if !operand.is_array() => return "FALSE".to_string(),
        _ => None,
    };

    let path = format!("(data -> {})", binder.text(field));
    match op {
        Operator::Eq => format!("{path} = {}", binder.json(operand)),
        Operator::Ne => format!("{path} IS DISTINCT FROM {}", binder.json(operand)),
        Operator::In | Operator::Nin => {
            let member = format!(
                "({path} IS NOT NULL AND jsonb_build_array({path}) <@ {})",
                binder.json(operand)
            );
            if op == Operator::In {
                member
            } else {
                format!("NOT {member}")
            }
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => format!(
            "(jsonb_typeof({path}) = '{}' AND {path} {} {})",
            guard.unwrap_or("null"),
            comparison(op),
            binder.json(operand)
        ),
    }
}

fn where_clause(binder: &mut Binder, filter: &Filter) -> String {
    let mut predicates = Vec::new();
    for (field, clauses) in filter.predicates() {
        for clause in clauses {
            let predicate = match Column::for_field(field) {
                Some(column) => column_predicate(binder, column, clause.op, &clause.operand),
                None => data_predicate(binder, field, clause.op, &clause.operand),
            };
            predicates.push(predicate);
        }
    }
    if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    }
}

fn order_clause(binder: &mut Binder, options: &FindOptions) -> String {
    let mut keys = Vec::new();
    for key in &options.sort {
        let direction = match key.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        match Column::for_field(&key.field) {
            Some(column) => keys.push(format!("{} {direction}", column.name())),
            None => {
                let path = format!("(data -> {})", binder.text(&key.field));
                // missing < null < bool < number < string < array < object
                keys.push(format!(
                    "CASE jsonb_typeof({path}) WHEN 'null' THEN 1 WHEN 'boolean' THEN 2 \
                     WHEN 'number' THEN 3 WHEN 'string' THEN 4 WHEN 'array' THEN 5 \
                     WHEN 'object' THEN 6 ELSE 0 END {direction}"
                ));
                keys.push(format!("{path} {direction}"));
            }
        }
    }
    keys.push("seq ASC".to_string());
    format!(" ORDER BY {}", keys.join(", "))
}

// =============================================================================
// Statements
// =============================================================================

/// `SELECT` matching documents with sort/skip/limit.
#[must_use]
pub fn select(table: &str, filter: &Filter, options: &FindOptions) -> SqlStatement {
    let mut binder = Binder::default();
    let mut sql = format!("SELECT {DOCUMENT_COLUMNS} FROM {}", quote_ident(table));
    sql.push_str(&where_clause(&mut binder, filter));
    sql.push_str(&order_clause(&mut binder, options));
    if let Some(limit) = options.limit {
        let p = binder.bind(SqlParam::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
        let _ = write!(sql, " LIMIT {p}");
    }
    if options.skip > 0 {
        let p = binder.bind(SqlParam::Int(i64::try_from(options.skip).unwrap_or(i64::MAX)));
        let _ = write!(sql, " OFFSET {p}");
    }
    binder.finish(sql)
}

/// `SELECT COUNT(*)` of matching documents.
#[must_use]
pub fn count(table: &str, filter: &Filter) -> SqlStatement {
    let mut binder = Binder::default();
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    sql.push_str(&where_clause(&mut binder, filter));
    binder.finish(sql)
}

/// `SELECT` one document by id.
#[must_use]
pub fn select_by_id(table: &str, id: &str) -> SqlStatement {
    let mut binder = Binder::default();
    let p = binder.bind(SqlParam::Text(id.to_string()));
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM {} WHERE id = {p}",
        quote_ident(table)
    );
    binder.finish(sql)
}

/// `INSERT` a new document.
#[must_use]
pub fn insert(table: &str, doc: &Document) -> SqlStatement {
    let mut binder = Binder::default();
    let id = binder.bind(SqlParam::Text(doc.id.clone()));
    let data = binder.bind(SqlParam::Json(Value::Object(doc.fields.clone())));
    let created = binder.bind(SqlParam::Timestamp(doc.created_at));
    let updated = binder.bind(SqlParam::Timestamp(doc.updated_at));
    let sql = format!(
        "INSERT INTO {} (id, data, created_at, updated_at) VALUES ({id}, {data}, {created}, {updated}) \
         RETURNING {DOCUMENT_COLUMNS}",
        quote_ident(table)
    );
    binder.finish(sql)
}

/// Shallow-merge `patch` into `data`; the trigger refreshes `updated_at`.
///
/// Reserved keys must already be stripped from `patch`.
#[must_use]
pub fn update(table: &str, id: &str, patch: Fields) -> SqlStatement {
    let mut binder = Binder::default();
    let data = binder.bind(SqlParam::Json(Value::Object(patch)));
    let p = binder.bind(SqlParam::Text(id.to_string()));
    let sql = format!(
        "UPDATE {} SET data = data || {data}::jsonb WHERE id = {p} RETURNING {DOCUMENT_COLUMNS}",
        quote_ident(table)
    );
    binder.finish(sql)
}

/// `DELETE` by id, returning the removed row.
#[must_use]
pub fn delete(table: &str, id: &str) -> SqlStatement {
    let mut binder = Binder::default();
    let p = binder.bind(SqlParam::Text(id.to_string()));
    let sql = format!(
        "DELETE FROM {} WHERE id = {p} RETURNING {DOCUMENT_COLUMNS}",
        quote_ident(table)
    );
    binder.finish(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_names_are_bound() {
        let filter = Filter::new().eq("title'; DROP TABLE talks; --", "x");
        let stmt = select("talks", &filter, &FindOptions::default());
        assert!(!stmt.sql.contains("DROP"));
        assert_eq!(
            stmt.params[0],
            SqlParam::Text("title'; DROP TABLE talks; --".into())
        );
        assert_eq!(
            stmt.sql,
            "SELECT id, data, created_at, updated_at FROM \"talks\" \
             WHERE (data -> $1::text) = $2::jsonb ORDER BY seq ASC"
        );
    }

    #[test]
    fn test_range_has_type_guard() {
        let stmt = count("events", &Filter::new().gte("capacity", 10));
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) FROM \"events\" WHERE (jsonb_typeof((data -> $1::text)) = 'number' \
             AND (data -> $1::text) >= $2::jsonb)"
        );
        assert_eq!(stmt.params.len(), 2);

        let stmt = count("events", &Filter::new().gt("tags", json!(["a"])));
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM \"events\" WHERE FALSE");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_columns_and_cross_type() {
        let filter = Filter::new()
            .eq("id", "t1")
            .gte("createdAt", "2025-01-01T00:00:00.000Z")
            .eq("updatedAt", 5);
        let stmt = select("talks", &filter, &FindOptions::default());
        assert!(stmt.sql.contains("COLLATE \"C\") >= $1"));
        assert!(stmt.sql.contains("id = $2"));
        assert!(stmt.sql.contains("FALSE"));
        assert_eq!(stmt.params[0], SqlParam::Text("2025-01-01T00:00:00.000Z".into()));

        let ne = select("talks", &Filter::new().ne("id", 3), &FindOptions::default());
        assert!(ne.sql.contains("WHERE TRUE"));
    }

    #[test]
    fn test_timestamp_filters_compare_serialized_form() {
        let doc = Document::from_input(
            Fields::new(),
            crate::document::parse_timestamp("2025-06-01T00:30:00.000Z").unwrap(),
            || "t1".into(),
        )
        .unwrap();

        // Date prefix and offset operands: both compare as strings everywhere.
        for (field, op, operand, in_memory) in [
            ("createdAt", Operator::Gte, "2025-01-01", true),
            ("createdAt", Operator::Lt, "2025-06-01T09:00:00+09:00", true),
            ("updatedAt", Operator::Gte, "2025-06-01T09:00:00+09:00", false),
        ] {
            let filter = Filter::new().with_clause(field, op, operand);
            assert_eq!(filter.matches(&doc), in_memory);
            assert_eq!(filter.matches_item(&doc.to_item()), in_memory);

            let stmt = select("talks", &filter, &FindOptions::default());
            assert!(!stmt.sql.contains("FALSE"), "{}", stmt.sql);
            assert!(stmt.sql.contains("'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"'"));
            assert_eq!(stmt.params, vec![SqlParam::Text(operand.to_string())]);
        }
    }

    #[test]
    fn test_in_and_nin() {
        let stmt = select(
            "users",
            &Filter::new().not_in("role", vec![json!("admin")]),
            &FindOptions::default(),
        );
        assert!(stmt
            .sql
            .contains("NOT ((data -> $1::text) IS NOT NULL AND jsonb_build_array((data -> $1::text)) <@ $2::jsonb)"));

        let ids = select(
            "users",
            &Filter::new().is_in("id", vec![json!("a"), json!(1), json!("b")]),
            &FindOptions::default(),
        );
        assert!(ids.sql.contains("(id = $1 OR id = $2)"));
        assert_eq!(ids.params.len(), 2);

        let bad = select(
            "users",
            &Filter::new().with_clause("role", Operator::In, "admin"),
            &FindOptions::default(),
        );
        assert!(bad.sql.contains("WHERE FALSE"));
    }

    #[test]
    fn test_order_limit_offset() {
        let options = FindOptions::new()
            .sort_by("createdAt", SortOrder::Desc)
            .sort_by("title", SortOrder::Asc)
            .with_skip(5)
            .with_limit(10);
        let stmt = select("talks", &Filter::new(), &options);
        assert!(stmt.sql.contains("ORDER BY created_at DESC, CASE jsonb_typeof"));
        assert!(stmt.sql.ends_with("(data -> $1::text) ASC, seq ASC LIMIT $2 OFFSET $3"));
        assert_eq!(stmt.params[1], SqlParam::Int(10));
        assert_eq!(stmt.params[2], SqlParam::Int(5));
    }

    #[test]
    fn test_update_merges_patch() {
        let mut patch = Fields::new();
        patch.insert("title".into(), json!("new"));
        let stmt = update("talks", "t1", patch);
        assert_eq!(
            stmt.sql,
            "UPDATE \"talks\" SET data = data || $1::jsonb WHERE id = $2 \
             RETURNING id, data, created_at, updated_at"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("lt_events"), "\"lt_events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
