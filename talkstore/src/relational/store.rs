//! `RelationalStore` and its scoped transactions over `sqlx::PgPool`.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgExecutor, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use tokio::time::Instant;

use super::migrations;
use super::sql::{self, SqlParam, SqlStatement};
use crate::backend::{BackendKind, HealthStatus, PerformanceStats, PoolStatus, StorageBackend};
use crate::collection::Collection;
use crate::config::RelationalConfig;
use crate::document::{is_reserved, now_millis, uuid_id, Document, Fields};
use crate::error::{StorageError, StorageResult};
use crate::lifecycle::{Lifecycle, QueryCounters};
use crate::query::{Filter, FindOptions};

const UNIQUE_VIOLATION: &str = "23505";

// =============================================================================
// Error Mapping
// =============================================================================

/// Classify a driver error into the storage taxonomy.
pub(crate) fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut => StorageError::timeout("connection pool timed out"),
        sqlx::Error::PoolClosed => StorageError::connection("connection pool closed"),
        sqlx::Error::Io(io) => StorageError::connection(io.to_string()),
        sqlx::Error::Tls(tls) => StorageError::connection(tls.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StorageError::serialization(e.to_string())
        }
        other => StorageError::permanent(other.to_string()),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

// =============================================================================
// Statement Execution
// =============================================================================

fn build_query(stmt: &SqlStatement) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(&stmt.sql);
    for param in &stmt.params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Json(v) => query.bind(sqlx::types::Json(v)),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

fn row_to_document(row: &PgRow) -> StorageResult<Document> {
    let id: String = row.try_get("id").map_err(map_sqlx_error)?;
    let data: sqlx::types::Json<Value> = row.try_get("data").map_err(map_sqlx_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_error)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(map_sqlx_error)?;

    let fields = match data.0 {
        Value::Object(fields) => fields,
        other => {
            return Err(StorageError::serialization(format!(
                "row {id} holds non-object data: {other}"
            )))
        }
    };
    Ok(Document {
        id,
        created_at: created_at.trunc_subsecs(3),
        updated_at: updated_at.trunc_subsecs(3),
        fields,
    })
}

async fn find_all_in<'c, E: PgExecutor<'c>>(
    executor: E,
    table: &str,
    filter: &Filter,
    options: &FindOptions,
) -> StorageResult<Vec<Document>> {
    let stmt = sql::select(table, filter, options);
    let rows = build_query(&stmt)
        .fetch_all(executor)
        .await
        .map_err(map_sqlx_error)?;
    rows.iter().map(row_to_document).collect()
}

async fn find_by_id_in<'c, E: PgExecutor<'c>>(
    executor: E,
    table: &str,
    id: &str,
) -> StorageResult<Option<Document>> {
    let stmt = sql::select_by_id(table, id);
    let row = build_query(&stmt)
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?;
    row.as_ref().map(row_to_document).transpose()
}

async fn create_in<'c, E: PgExecutor<'c>>(
    executor: E,
    table: &str,
    collection: Collection,
    fields: Fields,
) -> StorageResult<Document> {
    let doc = Document::from_input(fields, now_millis(), uuid_id)?;
    let stmt = sql::insert(table, &doc);
    match build_query(&stmt).fetch_one(executor).await {
        Ok(row) => row_to_document(&row),
        Err(e) if is_unique_violation(&e) => Err(StorageError::duplicate_key(collection, doc.id)),
        Err(e) => Err(map_sqlx_error(e)),
    }
}

async fn update_in<'c, E: PgExecutor<'c>>(
    executor: E,
    table: &str,
    collection: Collection,
    id: &str,
    patch: Fields,
) -> StorageResult<Document> {
    let patch: Fields = patch.into_iter().filter(|(k, _)| !is_reserved(k)).collect();
    let stmt = sql::update(table, id, patch);
    let row = build_query(&stmt)
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?;
    match row {
        Some(row) => row_to_document(&row),
        None => Err(StorageError::not_found(collection, id)),
    }
}

async fn delete_in<'c, E: PgExecutor<'c>>(
    executor: E,
    table: &str,
    collection: Collection,
    id: &str,
) -> StorageResult<Document> {
    let stmt = sql::delete(table, id);
    let row = build_query(&stmt)
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?;
    match row {
        Some(row) => row_to_document(&row),
        None => Err(StorageError::not_found(collection, id)),
    }
}

// =============================================================================
// RelationalStore
// =============================================================================

/// PostgreSQL backend over a bounded connection pool.
///
/// # Example
/// ```ignore
/// let store = RelationalStore::new(RelationalConfig::new("postgres://localhost/talks"));
/// store.initialize().await?;
/// ```
#[derive(Debug)]
pub struct RelationalStore {
    config: RelationalConfig,
    pool: RwLock<Option<PgPool>>,
    lifecycle: Lifecycle,
    counters: QueryCounters,
}

impl RelationalStore {
    /// Uninitialized store; the pool is built by `initialize()`.
    #[must_use]
    pub fn new(config: RelationalConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            lifecycle: Lifecycle::new(),
            counters: QueryCounters::default(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RelationalConfig {
        &self.config
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// ```ignore
    /// store.transaction(|tx| Box::pin(async move {
    ///     let talk = tx.create(Collection::Talks, fields).await?;
    ///     tx.update(Collection::Events, &event_id, patch).await?;
    ///     Ok(talk)
    /// })).await?;
    /// ```
    ///
    /// # Errors
    /// The callback's error (after rollback), or a driver error.
    pub async fn transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut RelationalTransaction) -> BoxFuture<'t, StorageResult<T>> + Send,
    {
        let pool = self.pool()?;
        let tx = pool.begin().await.map_err(map_sqlx_error)?;
        let mut scoped = RelationalTransaction {
            tx,
            config: self.config.clone(),
        };

        match f(&mut scoped).await {
            Ok(value) => {
                scoped.tx.commit().await.map_err(map_sqlx_error)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = scoped.tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                tracing::debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }

    fn pool(&self) -> StorageResult<PgPool> {
        self.lifecycle.ensure_ready()?;
        self.pool
            .read()
            .clone()
            .ok_or_else(|| StorageError::not_initialized(self.lifecycle.state()))
    }

    async fn connect(&self) -> StorageResult<PgPool> {
        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| StorageError::validation("DATABASE_URL is required"))?;
        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
            return Err(StorageError::validation(
                "connection string must start with postgres:// or postgresql://",
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.config.pool_max)
            .idle_timeout(self.config.idle_timeout)
            .acquire_timeout(self.config.connect_timeout)
            .connect(url)
            .await
            .map_err(|e| StorageError::connection(format!("failed to connect: {e}")))?;

        let setup = match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => migrations::run(&pool, &self.config).await,
            Err(e) => Err(map_sqlx_error(e)),
        };
        if let Err(e) = setup {
            pool.close().await;
            return Err(e);
        }
        Ok(pool)
    }
}

#[async_trait]
impl StorageBackend for RelationalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    #[tracing::instrument(skip(self), fields(pool_max = self.config.pool_max))]
    async fn initialize(&self) -> StorageResult<()> {
        if !self.lifecycle.begin_initialize()? {
            return Ok(());
        }
        match self.connect().await {
            Ok(pool) => {
                *self.pool.write() = Some(pool);
                self.lifecycle.mark_ready();
                tracing::info!("relational store ready");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.mark_failed();
                tracing::error!(error = %e, "relational store failed to initialize");
                Err(e)
            }
        }
    }

    async fn find_all(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>> {
        let pool = self.pool()?;
        let started = Instant::now();
        let docs = find_all_in(&pool, &self.config.table_name(collection), filter, options).await?;
        self.counters.record_query(started.elapsed());
        Ok(docs)
    }

    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> StorageResult<Option<Document>> {
        let pool = self.pool()?;
        find_by_id_in(&pool, &self.config.table_name(collection), id).await
    }

    async fn create(&self, collection: Collection, fields: Fields) -> StorageResult<Document> {
        let pool = self.pool()?;
        create_in(&pool, &self.config.table_name(collection), collection, fields).await
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Fields,
    ) -> StorageResult<Document> {
        let pool = self.pool()?;
        update_in(&pool, &self.config.table_name(collection), collection, id, patch).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> StorageResult<Document> {
        let pool = self.pool()?;
        delete_in(&pool, &self.config.table_name(collection), collection, id).await
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> StorageResult<usize> {
        let pool = self.pool()?;
        let stmt = sql::count(&self.config.table_name(collection), filter);
        let row = build_query(&stmt)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.try_get(0).map_err(map_sqlx_error)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn health(&self) -> StorageResult<HealthStatus> {
        let mut status = HealthStatus::new(self.kind(), self.lifecycle.state())
            .with_uptime(self.lifecycle.uptime());
        let pool = self.pool.read().clone();
        let Some(pool) = pool else {
            return Ok(status);
        };

        let size = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(size);
        status.pool = Some(PoolStatus {
            size,
            idle,
            active: size.saturating_sub(idle),
            max: self.config.pool_max,
        });
        if status.healthy {
            if let Err(e) = sqlx::query("SELECT NOW()").execute(&pool).await {
                status.healthy = false;
                status.detail = Some(e.to_string());
            }
        }
        Ok(status)
    }

    async fn performance_stats(&self) -> StorageResult<PerformanceStats> {
        let mut stats = PerformanceStats {
            query_count: self.counters.queries(),
            average_query_ms: self.counters.average_query_ms(),
            ..PerformanceStats::default()
        };
        for collection in Collection::all() {
            let count = self.count(*collection, &Filter::new()).await?;
            stats.record_counts.insert(*collection, count);
        }
        Ok(stats)
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.counters.reset();
        self.lifecycle.mark_closed();
        tracing::info!("relational store closed");
        Ok(())
    }
}

// =============================================================================
// RelationalTransaction
// =============================================================================

/// Document operations bound to one open transaction.
pub struct RelationalTransaction {
    tx: Transaction<'static, Postgres>,
    config: RelationalConfig,
}

impl std::fmt::Debug for RelationalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalTransaction")
            .field("table_prefix", &self.config.table_prefix)
            .finish_non_exhaustive()
    }
}

impl RelationalTransaction {
    /// Insert within the transaction.
    ///
    /// # Errors
    /// `DuplicateKey` if the id exists.
    pub async fn create(&mut self, collection: Collection, fields: Fields) -> StorageResult<Document> {
        let table = self.config.table_name(collection);
        create_in(&mut *self.tx, &table, collection, fields).await
    }

    /// Merge a patch within the transaction.
    ///
    /// # Errors
    /// `NotFound` if the id is absent.
    pub async fn update(
        &mut self,
        collection: Collection,
        id: &str,
        patch: Fields,
    ) -> StorageResult<Document> {
        let table = self.config.table_name(collection);
        update_in(&mut *self.tx, &table, collection, id, patch).await
    }

    /// Delete within the transaction.
    ///
    /// # Errors
    /// `NotFound` if the id is absent.
    pub async fn delete(&mut self, collection: Collection, id: &str) -> StorageResult<Document> {
        let table = self.config.table_name(collection);
        delete_in(&mut *self.tx, &table, collection, id).await
    }

    /// Read by id, seeing this transaction's writes.
    ///
    /// # Errors
    /// Driver errors.
    pub async fn find_by_id(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> StorageResult<Option<Document>> {
        let table = self.config.table_name(collection);
        find_by_id_in(&mut *self.tx, &table, id).await
    }

    /// Query, seeing this transaction's writes.
    ///
    /// # Errors
    /// Driver errors.
    pub async fn find_all(
        &mut self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>> {
        let table = self.config.table_name(collection);
        find_all_in(&mut *self.tx, &table, filter, options).await
    }
}
