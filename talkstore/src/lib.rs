//! # talkstore
//!
//! Storage abstraction layer for the event-registration platform: one
//! document contract over an embedded file store, PostgreSQL and a managed
//! key-value service.
//!
//! ## Features
//!
//! - **Uniform contract**: [`StorageBackend`] with CRUD, filters, sort/skip/limit
//! - **Embedded store**: in-memory collections, hash indexes, LRU query cache,
//!   debounced JSON persistence, per-collection async locks
//! - **Relational store**: pooled `sqlx` connections, JSONB documents,
//!   migrations at startup, scoped transactions (`postgres` feature)
//! - **Distributed store**: conditional writes, index-aware queries, batch
//!   chunking, exponential backoff with jitter
//! - **Deterministic testing**: seeded RNG and fault injection for every
//!   I/O boundary
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use talkstore::{Collection, EmbeddedConfig, Filter, StorageConfig, StorageFactory, StorageHandle};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> talkstore::StorageResult<()> {
//! let config = StorageConfig::default().with_embedded(EmbeddedConfig::new("./data"));
//! let storage = StorageHandle::open(StorageFactory::new(), config).await?;
//!
//! let backend = storage.backend();
//! let fields = json!({"title": "Lightning Night", "status": "upcoming"});
//! let event = backend
//!     .create(Collection::Events, fields.as_object().cloned().unwrap_or_default())
//!     .await?;
//!
//! let upcoming = backend
//!     .find(Collection::Events, &Filter::new().eq("status", "upcoming"))
//!     .await?;
//! assert!(upcoming.iter().any(|doc| doc.id == event.id));
//!
//! storage.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │             StorageHandle ── StorageFactory             │
//! ├─────────────────────────────────────────────────────────┤
//! │                 dyn StorageBackend                      │
//! ├──────────────────┬──────────────────┬───────────────────┤
//! │  EmbeddedStore   │ RelationalStore  │ DistributedStore  │
//! │  (JSON files)    │ (sqlx PgPool)    │ (KeyValueClient)  │
//! │                  │                  │  + RetryExecutor  │
//! ├──────────────────┴──────────────────┴───────────────────┤
//! │  DST Framework        │ Fault injection + seeded RNG    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL backend (`RelationalStore`)
//! - `dynamodb` - DynamoDB client for the distributed backend (`DynamoDbClient`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod collection;
pub mod config;
pub mod constants;
pub mod distributed;
pub mod document;
pub mod dst;
pub mod embedded;
pub mod error;
pub mod factory;
mod lifecycle;
pub mod query;
pub mod relational;
pub mod retry;
pub mod settings;

// Re-export common types
pub use backend::{
    BackendKind, CollectionStats, ExportData, HealthStatus, PerformanceStats, PoolStatus,
    StorageBackend, StoreState,
};
pub use collection::Collection;
pub use config::{DistributedConfig, EmbeddedConfig, RelationalConfig, StorageConfig};
pub use distributed::{DistributedStore, KeyValueClient, SimKeyValueClient};
pub use document::{Document, Fields};
pub use dst::{DeterministicRng, FaultConfig, FaultInjector, FaultInjectorBuilder, FaultType, SimConfig};
pub use embedded::{CollectionGuard, EmbeddedStore, StoreEvent};
pub use error::{StorageError, StorageResult, TransientKind};
pub use factory::{supported_types, BackendDescriptor, StorageFactory, StorageHandle, ValidationReport};
pub use query::{Filter, FindOptions, Operator, SortOrder};
pub use retry::{BatchWriteReport, RetryExecutor, RetryPolicy};
pub use settings::SiteDefaults;

#[cfg(feature = "postgres")]
pub use relational::{RelationalStore, RelationalTransaction};
#[cfg(feature = "dynamodb")]
pub use distributed::DynamoDbClient;
