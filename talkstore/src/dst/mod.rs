//! DST - Deterministic Simulation Testing
//!
//! Seeded randomness and fault injection shared by the in-process key-value
//! client, the embedded store's persistence task and the retry executor.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use talkstore::dst::{DeterministicRng, FaultConfig, FaultInjectorBuilder, FaultType};
//!
//! let faults = FaultInjectorBuilder::new(DeterministicRng::new(42))
//!     .with_fault(FaultConfig::new(FaultType::KvThrottled, 1.0).with_max_injections(2))
//!     .build();
//! let faults = Arc::new(faults);
//! assert_eq!(faults.should_inject("kv_put_item"), Some(FaultType::KvThrottled));
//! ```
//!
//! Run with explicit seed for reproducibility:
//! ```bash
//! DST_SEED=12345 cargo test
//! ```

mod config;
mod fault;
mod rng;

pub use config::SimConfig;
pub use fault::{FaultConfig, FaultInjector, FaultInjectorBuilder, FaultType};
pub use rng::DeterministicRng;
