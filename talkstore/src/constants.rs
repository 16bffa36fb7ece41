//! `TigerStyle` Constants
//!
//! All limits use big-endian naming: `CATEGORY_SPECIFICS_UNIT_LIMIT`
//! Example: `STORAGE_RETRY_DELAY_MS_MAX` (not `MAX_RETRY_DELAY`)
//!
//! Every constant includes units in the name:
//! - _`MS` / _`SECS` for time durations
//! - _`COUNT_MAX` for quantity limits
//! - _`DEFAULT` for tunable defaults

// =============================================================================
// Retry Limits
// =============================================================================

/// Additional attempts after the first one (total attempts = this + 1)
pub const STORAGE_RETRY_COUNT_MAX: u32 = 3;

/// Base delay for exponential backoff
pub const STORAGE_RETRY_DELAY_MS_BASE: u64 = 100;

/// Upper bound for a single backoff delay
pub const STORAGE_RETRY_DELAY_MS_MAX: u64 = 5000;

/// Jitter is drawn from `[0, exponential_delay * this]`
pub const STORAGE_RETRY_JITTER_RATIO: f64 = 0.25;

/// Hard ceiling on configurable retries
pub const STORAGE_RETRY_COUNT_LIMIT: u32 = 20;

// =============================================================================
// Embedded Store
// =============================================================================

/// Debounce window coalescing bursts of mutations into one flush
pub const EMBEDDED_SAVE_DEBOUNCE_MS_DEFAULT: u64 = 1000;

/// A stream of mutations delays a save by at most this many debounce windows
pub const EMBEDDED_SAVE_DELAY_WINDOWS_MAX: u32 = 10;

/// Query cache capacity (entries)
pub const EMBEDDED_QUERY_CACHE_ENTRIES_DEFAULT: usize = 100;

/// How long `close()` waits for held collection locks
pub const EMBEDDED_CLOSE_LOCK_WAIT_MS_DEFAULT: u64 = 5000;

/// Store event channel capacity
pub const EMBEDDED_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Length of the random suffix of generated ids
pub const EMBEDDED_ID_SUFFIX_CHARS_COUNT: usize = 9;

/// Default data directory
pub const EMBEDDED_DATA_DIR_DEFAULT: &str = "./data";

// =============================================================================
// Relational Store
// =============================================================================

/// Maximum pooled connections
pub const RELATIONAL_POOL_CONNECTIONS_DEFAULT: u32 = 20;

/// Pool size accepted without a warning
pub const RELATIONAL_POOL_CONNECTIONS_MAX: u32 = 100;

/// Idle connection timeout
pub const RELATIONAL_POOL_IDLE_TIMEOUT_MS_DEFAULT: u64 = 30_000;

/// Connect timeout
pub const RELATIONAL_POOL_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 2000;

// =============================================================================
// Distributed Store
// =============================================================================

/// Per-request item limit of the key-value service
pub const DISTRIBUTED_BATCH_ITEMS_COUNT_MAX: usize = 25;

/// Default table prefix (`<prefix><collection>`)
pub const DISTRIBUTED_TABLE_PREFIX_DEFAULT: &str = "lightningtalk-circle-";

/// Default region
pub const DISTRIBUTED_REGION_DEFAULT: &str = "ap-northeast-1";

/// Items returned per scan/query page by the in-process client
pub const DISTRIBUTED_SIM_PAGE_ITEMS_COUNT: usize = 100;

// =============================================================================
// Export
// =============================================================================

/// Version tag written into exports
pub const EXPORT_FORMAT_VERSION: &str = "1.0.0";

// =============================================================================
// DST (Deterministic Simulation Testing)
// =============================================================================

/// Maximum fault injection probability
pub const DST_FAULT_PROBABILITY_MAX: f64 = 1.0;

/// Minimum fault injection probability
pub const DST_FAULT_PROBABILITY_MIN: f64 = 0.0;
