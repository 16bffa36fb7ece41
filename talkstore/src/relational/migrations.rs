//! Idempotent schema setup, applied in one transaction at startup.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS "<prefix><collection>" (
//!     seq BIGSERIAL,
//!     id TEXT PRIMARY KEY,
//!     data JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! Plus a `created_at` btree index, a GIN index on `data` and a
//! `BEFORE UPDATE` trigger refreshing `updated_at`.

use super::sql::quote_ident;
use crate::collection::Collection;
use crate::config::RelationalConfig;

/// Statements to run, in order.
#[must_use]
pub fn statements(config: &RelationalConfig) -> Vec<String> {
    let function = quote_ident(&format!("{}touch_updated_at", config.table_prefix));
    let mut statements = vec![format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$ \
         BEGIN NEW.updated_at = NOW(); RETURN NEW; END; $$ LANGUAGE plpgsql"
    )];

    for collection in Collection::all() {
        let name = config.table_name(*collection);
        let table = quote_ident(&name);
        let created_index = quote_ident(&format!("{name}_created_at_idx"));
        let data_index = quote_ident(&format!("{name}_data_gin_idx"));
        let trigger = quote_ident(&format!("{name}_touch_updated_at"));

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             seq BIGSERIAL, \
             id TEXT PRIMARY KEY, \
             data JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {created_index} ON {table} (created_at)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {data_index} ON {table} USING GIN (data)"
        ));
        statements.push(format!("DROP TRIGGER IF EXISTS {trigger} ON {table}"));
        statements.push(format!(
            "CREATE TRIGGER {trigger} BEFORE UPDATE ON {table} \
             FOR EACH ROW EXECUTE FUNCTION {function}()"
        ));
    }
    statements
}

/// Run every statement in one transaction; any failure rolls back all.
#[cfg(feature = "postgres")]
pub(crate) async fn run(
    pool: &sqlx::PgPool,
    config: &RelationalConfig,
) -> crate::error::StorageResult<usize> {
    let statements = statements(config);
    let mut tx = pool.begin().await.map_err(super::map_sqlx_error)?;
    for statement in &statements {
        if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
            tracing::error!(statement = %statement, error = %e, "migration failed");
            // Dropping the transaction rolls back; an explicit rollback reports errors.
            let _ = tx.rollback().await;
            return Err(super::map_sqlx_error(e));
        }
    }
    tx.commit().await.map_err(super::map_sqlx_error)?;
    tracing::info!(statements = statements.len(), "migrations applied");
    Ok(statements.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_cover_every_collection() {
        let config = RelationalConfig::default().with_table_prefix("lt_");
        let statements = statements(&config);

        // function + 5 per collection
        assert_eq!(statements.len(), 1 + 5 * Collection::all().len());
        assert!(statements[0].contains("\"lt_touch_updated_at\"()"));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"lt_events\"")));
        assert!(statements
            .iter()
            .any(|s| s.contains("USING GIN (data)") && s.contains("\"lt_talks\"")));
    }

    #[test]
    fn test_trigger_recreated() {
        let statements = statements(&RelationalConfig::default());
        let drop = statements
            .iter()
            .position(|s| s == "DROP TRIGGER IF EXISTS \"users_touch_updated_at\" ON \"users\"")
            .unwrap();
        assert!(statements[drop + 1].starts_with("CREATE TRIGGER \"users_touch_updated_at\""));
    }

    #[test]
    fn test_default_json_literal() {
        let statements = statements(&RelationalConfig::default());
        assert!(statements[1].contains("DEFAULT '{}'::jsonb"));
    }
}
