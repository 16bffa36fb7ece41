//! RelationalStore - Pooled PostgreSQL Backend
//!
//! `TigerStyle`: Bounded pool, parameterized SQL, migrations in one
//! transaction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RelationalStore                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pool: sqlx::PgPool (max 20, idle 30s, connect 2s)          │
//! │  Table per collection: (seq, id, data JSONB, timestamps)    │
//! │  Index: btree on created_at, GIN on data                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The statement builder ([`sql`]) and the schema ([`migrations`]) are
//! always compiled; the pool lives behind the `postgres` feature.

pub mod migrations;
pub mod sql;

#[cfg(feature = "postgres")]
mod store;

#[cfg(feature = "postgres")]
pub use store::{RelationalStore, RelationalTransaction};

#[cfg(feature = "postgres")]
pub(crate) use store::map_sqlx_error;
