//! Storage Configuration
//!
//! `TigerStyle`: Sensible defaults, builder pattern, explicit over implicit.
//!
//! [`StorageConfig`] is plain data compared by structural equality; a
//! changed config is what makes `StorageHandle::reconfigure` recycle the
//! backend.
//!
//! # Environment
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `DATABASE_TYPE` | `file`/`json`, `postgresql`/`postgres`/`pg`, `dynamodb` | `file` |
//! | `DATABASE_FILE_DIR` | embedded data directory | `./data` |
//! | `STORAGE_SAVE_DEBOUNCE_MS` | embedded flush debounce | `1000` |
//! | `STORAGE_QUERY_CACHE_SIZE` | embedded query cache entries | `100` |
//! | `DATABASE_URL` | relational connection string | none |
//! | `DB_POOL_SIZE` | relational pool maximum | `20` |
//! | `DB_IDLE_TIMEOUT_MS` / `DB_CONNECT_TIMEOUT_MS` | pool timeouts | `30000` / `2000` |
//! | `DB_TABLE_PREFIX` | relational table name prefix | empty |
//! | `AWS_REGION` | distributed region | `ap-northeast-1` |
//! | `DYNAMODB_ENDPOINT` | distributed endpoint override | none |
//! | `DYNAMODB_<COLLECTION>_TABLE` | per-collection table | `lightningtalk-circle-<collection>` |
//! | `STORAGE_RETRY_MAX` / `STORAGE_RETRY_BASE_DELAY_MS` / `STORAGE_RETRY_MAX_DELAY_MS` | retry policy | `3` / `100` / `5000` |
//! | `SITE_URL` / `ADMIN_EMAIL` / `EMAIL_ENABLED` | seeded settings | see [`SiteDefaults`] |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::collection::Collection;
use crate::constants::{
    DISTRIBUTED_BATCH_ITEMS_COUNT_MAX, DISTRIBUTED_REGION_DEFAULT,
    DISTRIBUTED_TABLE_PREFIX_DEFAULT, EMBEDDED_CLOSE_LOCK_WAIT_MS_DEFAULT,
    EMBEDDED_DATA_DIR_DEFAULT, EMBEDDED_QUERY_CACHE_ENTRIES_DEFAULT,
    EMBEDDED_SAVE_DEBOUNCE_MS_DEFAULT, RELATIONAL_POOL_CONNECTIONS_DEFAULT,
    RELATIONAL_POOL_CONNECT_TIMEOUT_MS_DEFAULT, RELATIONAL_POOL_IDLE_TIMEOUT_MS_DEFAULT,
};
use crate::error::{StorageError, StorageResult};
use crate::retry::RetryPolicy;
use crate::settings::SiteDefaults;

// =============================================================================
// EmbeddedConfig
// =============================================================================

/// Configuration of the file-backed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedConfig {
    /// Directory holding one `<collection>.json` per collection.
    ///
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Quiet period after the last mutation before a flush.
    ///
    /// Default: 1 second
    pub save_debounce: Duration,

    /// Query cache capacity (0 disables caching).
    ///
    /// Default: 100
    pub query_cache_entries: usize,

    /// How long `close()` waits for held collection locks.
    ///
    /// Default: 5 seconds
    pub close_lock_wait: Duration,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(EMBEDDED_DATA_DIR_DEFAULT),
            save_debounce: Duration::from_millis(EMBEDDED_SAVE_DEBOUNCE_MS_DEFAULT),
            query_cache_entries: EMBEDDED_QUERY_CACHE_ENTRIES_DEFAULT,
            close_lock_wait: Duration::from_millis(EMBEDDED_CLOSE_LOCK_WAIT_MS_DEFAULT),
        }
    }
}

impl EmbeddedConfig {
    /// Config rooted at `data_dir` with default tuning.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Set the flush debounce.
    #[must_use]
    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    /// Set the query cache capacity.
    #[must_use]
    pub fn with_query_cache_entries(mut self, entries: usize) -> Self {
        self.query_cache_entries = entries;
        self
    }

    /// Set the close-time lock wait.
    #[must_use]
    pub fn with_close_lock_wait(mut self, wait: Duration) -> Self {
        self.close_lock_wait = wait;
        self
    }
}

// =============================================================================
// RelationalConfig
// =============================================================================

/// Configuration of the pooled SQL store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalConfig {
    /// `postgres://` or `postgresql://` connection string
    pub url: Option<String>,
    /// Maximum pooled connections (default 20)
    pub pool_max: u32,
    /// Idle connection timeout (default 30 seconds)
    pub idle_timeout: Duration,
    /// Connect timeout (default 2 seconds)
    pub connect_timeout: Duration,
    /// Prefix for table names (default empty)
    pub table_prefix: String,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_max: RELATIONAL_POOL_CONNECTIONS_DEFAULT,
            idle_timeout: Duration::from_millis(RELATIONAL_POOL_IDLE_TIMEOUT_MS_DEFAULT),
            connect_timeout: Duration::from_millis(RELATIONAL_POOL_CONNECT_TIMEOUT_MS_DEFAULT),
            table_prefix: String::new(),
        }
    }
}

impl RelationalConfig {
    /// Config for `url` with default pool settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Set the pool maximum.
    #[must_use]
    pub fn with_pool_max(mut self, pool_max: u32) -> Self {
        self.pool_max = pool_max;
        self
    }

    /// Set the table prefix.
    #[must_use]
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Table holding `collection`.
    #[must_use]
    pub fn table_name(&self, collection: Collection) -> String {
        format!("{}{}", self.table_prefix, collection.as_str())
    }
}

// =============================================================================
// DistributedConfig
// =============================================================================

/// Configuration of the key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Service region
    pub region: String,
    /// Endpoint override (local emulators)
    pub endpoint: Option<String>,
    /// Table per collection
    pub tables: BTreeMap<Collection, String>,
    /// Items per batch request (at most 25)
    pub batch_chunk_size: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        let tables = Collection::all()
            .iter()
            .map(|c| (*c, format!("{DISTRIBUTED_TABLE_PREFIX_DEFAULT}{}", c.as_str())))
            .collect();
        Self {
            region: DISTRIBUTED_REGION_DEFAULT.to_string(),
            endpoint: None,
            tables,
            batch_chunk_size: DISTRIBUTED_BATCH_ITEMS_COUNT_MAX,
        }
    }
}

impl DistributedConfig {
    /// Set the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set one collection's table.
    #[must_use]
    pub fn with_table(mut self, collection: Collection, table: impl Into<String>) -> Self {
        self.tables.insert(collection, table.into());
        self
    }

    /// Set the batch chunk size.
    #[must_use]
    pub fn with_batch_chunk_size(mut self, size: usize) -> Self {
        self.batch_chunk_size = size;
        self
    }

    /// Table holding `collection`.
    #[must_use]
    pub fn table_name(&self, collection: Collection) -> String {
        self.tables.get(&collection).cloned().unwrap_or_else(|| {
            format!("{DISTRIBUTED_TABLE_PREFIX_DEFAULT}{}", collection.as_str())
        })
    }
}

// =============================================================================
// StorageConfig
// =============================================================================

/// Complete storage configuration.
///
/// # Example
///
/// ```rust
/// use talkstore::{BackendKind, EmbeddedConfig, StorageConfig};
///
/// let config = StorageConfig::default()
///     .with_backend(BackendKind::Embedded)
///     .with_embedded(EmbeddedConfig::new("/tmp/talkstore"));
/// assert_eq!(config.backend, BackendKind::Embedded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Active backend
    pub backend: BackendKind,
    /// Embedded settings
    pub embedded: EmbeddedConfig,
    /// Relational settings
    pub relational: RelationalConfig,
    /// Distributed settings
    pub distributed: DistributedConfig,
    /// Retry policy for remote calls
    pub retry: RetryPolicy,
    /// Values seeded into the settings collection
    pub site: SiteDefaults,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Embedded,
            embedded: EmbeddedConfig::default(),
            relational: RelationalConfig::default(),
            distributed: DistributedConfig::default(),
            retry: RetryPolicy::default(),
            site: SiteDefaults::default(),
        }
    }
}

impl StorageConfig {
    /// Set the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set embedded settings.
    #[must_use]
    pub fn with_embedded(mut self, embedded: EmbeddedConfig) -> Self {
        self.embedded = embedded;
        self
    }

    /// Set relational settings.
    #[must_use]
    pub fn with_relational(mut self, relational: RelationalConfig) -> Self {
        self.relational = relational;
        self
    }

    /// Set distributed settings.
    #[must_use]
    pub fn with_distributed(mut self, distributed: DistributedConfig) -> Self {
        self.distributed = distributed;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the seeded site values.
    #[must_use]
    pub fn with_site(mut self, site: SiteDefaults) -> Self {
        self.site = site;
        self
    }

    /// Load from process environment.
    ///
    /// # Errors
    /// Returns `Validation` for malformed values.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (unset keys keep defaults).
    ///
    /// # Errors
    /// Returns `Validation` for malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StorageResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("DATABASE_TYPE") {
            config.backend = raw.parse()?;
        }

        if let Some(dir) = get("DATABASE_FILE_DIR") {
            config.embedded.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_opt::<u64>(&get, "STORAGE_SAVE_DEBOUNCE_MS")? {
            config.embedded.save_debounce = Duration::from_millis(ms);
        }
        if let Some(entries) = parse_opt::<usize>(&get, "STORAGE_QUERY_CACHE_SIZE")? {
            config.embedded.query_cache_entries = entries;
        }

        config.relational.url = get("DATABASE_URL");
        if let Some(size) = parse_opt::<u32>(&get, "DB_POOL_SIZE")? {
            config.relational.pool_max = size;
        }
        if let Some(ms) = parse_opt::<u64>(&get, "DB_IDLE_TIMEOUT_MS")? {
            config.relational.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_opt::<u64>(&get, "DB_CONNECT_TIMEOUT_MS")? {
            config.relational.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(prefix) = get("DB_TABLE_PREFIX") {
            config.relational.table_prefix = prefix;
        }

        if let Some(region) = get("AWS_REGION") {
            config.distributed.region = region;
        }
        config.distributed.endpoint = get("DYNAMODB_ENDPOINT");
        for collection in Collection::all() {
            if let Some(table) = get(&collection.table_env_var()) {
                config.distributed.tables.insert(*collection, table);
            }
        }

        if let Some(n) = parse_opt::<u32>(&get, "STORAGE_RETRY_MAX")? {
            config.retry.max_retries = n;
        }
        if let Some(ms) = parse_opt::<u64>(&get, "STORAGE_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_opt::<u64>(&get, "STORAGE_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(url) = get("SITE_URL") {
            config.site.site_url = url;
        }
        if let Some(email) = get("ADMIN_EMAIL") {
            config.site.admin_email = email;
        }
        config.site.email_enabled = get("EMAIL_ENABLED").is_some_and(|v| v == "true");

        Ok(config)
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> StorageResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                StorageError::validation(format!("{key} must be a number, got '{raw}': {e}"))
            })
        })
        .transpose()
}
