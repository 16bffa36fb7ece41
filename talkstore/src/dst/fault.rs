//! FaultInjector - Probabilistic Fault Injection
//!
//! `TigerStyle`: Explicit fault injection for chaos testing.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::rng::DeterministicRng;
use crate::constants::{DST_FAULT_PROBABILITY_MAX, DST_FAULT_PROBABILITY_MIN};
use crate::error::{StorageError, TransientKind};

/// Types of faults that can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    // =========================================================================
    // Key-Value Service Faults
    // =========================================================================
    /// Provisioned throughput exceeded / request throttled
    KvThrottled,
    /// Service unavailable (503)
    KvServiceUnavailable,
    /// Socket timeout
    KvTimeout,
    /// Connection reset
    KvConnectionReset,
    /// Request rejected as malformed (not retryable)
    KvValidation,
    /// Batch write accepts only part of the items
    KvUnprocessedItems,
    /// Write is applied but the response never arrives (reported as a timeout)
    KvResponseLost,

    // =========================================================================
    // Disk Faults
    // =========================================================================
    /// Collection file write fails
    DiskWriteFail,
    /// Collection file read fails
    DiskReadFail,
}

impl FaultType {
    /// Get the fault type name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KvThrottled => "kv_throttled",
            Self::KvServiceUnavailable => "kv_service_unavailable",
            Self::KvTimeout => "kv_timeout",
            Self::KvConnectionReset => "kv_connection_reset",
            Self::KvValidation => "kv_validation",
            Self::KvUnprocessedItems => "kv_unprocessed_items",
            Self::KvResponseLost => "kv_response_lost",
            Self::DiskWriteFail => "disk_write_fail",
            Self::DiskReadFail => "disk_read_fail",
        }
    }

    /// The error a backend reports when this fault fires during `operation`.
    #[must_use]
    pub fn to_error(&self, operation: &str) -> StorageError {
        let message = format!("injected {} during {operation}", self.as_str());
        match self {
            Self::KvThrottled | Self::KvUnprocessedItems => {
                StorageError::transient(TransientKind::Throttled, message)
            }
            Self::KvServiceUnavailable => {
                StorageError::transient(TransientKind::ServiceUnavailable, message)
            }
            Self::KvTimeout | Self::KvResponseLost => {
                StorageError::transient(TransientKind::Timeout, message)
            }
            Self::KvConnectionReset => {
                StorageError::transient(TransientKind::Connection, message)
            }
            Self::KvValidation => StorageError::validation(message),
            Self::DiskWriteFail | Self::DiskReadFail => StorageError::io(message),
        }
    }
}

/// Configuration for a specific fault.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// The type of fault
    pub fault_type: FaultType,
    /// Probability of injection (0.0 to 1.0)
    pub probability: f64,
    /// Optional operation filter (substring match)
    pub operation_filter: Option<String>,
    /// Maximum number of injections (None = unlimited)
    pub max_injections: Option<u64>,
}

impl FaultConfig {
    /// Create a new fault configuration.
    ///
    /// # Panics
    /// Panics if probability is not in [0, 1].
    #[must_use]
    pub fn new(fault_type: FaultType, probability: f64) -> Self {
        // Precondition
        assert!(
            (DST_FAULT_PROBABILITY_MIN..=DST_FAULT_PROBABILITY_MAX).contains(&probability),
            "probability must be in [0, 1], got {probability}"
        );

        Self {
            fault_type,
            probability,
            operation_filter: None,
            max_injections: None,
        }
    }

    /// Only inject into operations whose name contains `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.operation_filter = Some(filter.into());
        self
    }

    /// Stop injecting after `max` hits.
    ///
    /// # Panics
    /// Panics if `max` is zero.
    #[must_use]
    pub fn with_max_injections(mut self, max: u64) -> Self {
        // Precondition
        assert!(max > 0, "max_injections must be positive");
        self.max_injections = Some(max);
        self
    }
}

/// Fault injector for simulation testing.
///
/// Shared via `Arc`; the RNG and counters use interior mutability so
/// `should_inject` takes `&self`.
#[derive(Debug)]
pub struct FaultInjector {
    rng: Mutex<DeterministicRng>,
    configs: Vec<FaultConfig>,
    /// Injections per registered config, same order as `configs`
    hits: Mutex<Vec<u64>>,
}

impl FaultInjector {
    /// Create a new fault injector with the given RNG.
    #[must_use]
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            configs: Vec::new(),
            hits: Mutex::new(Vec::new()),
        }
    }

    /// Injector that never fires.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(DeterministicRng::new(0))
    }

    /// Register a fault configuration (before sharing via `Arc`).
    pub fn register(&mut self, config: FaultConfig) {
        self.configs.push(config);
        self.hits.get_mut().push(0);

        // Postcondition
        assert_eq!(self.configs.len(), self.hits.get_mut().len());
    }

    /// Check if a fault should be injected for the given operation.
    ///
    /// Returns the first registered fault that fires.
    pub fn should_inject(&self, operation: &str) -> Option<FaultType> {
        if self.configs.is_empty() {
            return None;
        }

        let mut hits = self.hits.lock();
        let mut rng = self.rng.lock();
        for (index, config) in self.configs.iter().enumerate() {
            if let Some(ref filter) = config.operation_filter {
                if !operation.contains(filter.as_str()) {
                    continue;
                }
            }
            if let Some(max) = config.max_injections {
                if hits[index] >= max {
                    continue;
                }
            }
            if rng.next_bool(config.probability) {
                hits[index] += 1;
                tracing::debug!(
                    fault = config.fault_type.as_str(),
                    operation,
                    "DST: injecting fault"
                );
                return Some(config.fault_type);
            }
        }
        None
    }

    /// Injections per fault type name.
    #[must_use]
    pub fn injection_stats(&self) -> HashMap<String, u64> {
        let hits = self.hits.lock();
        let mut stats = HashMap::new();
        for (config, count) in self.configs.iter().zip(hits.iter()) {
            *stats
                .entry(config.fault_type.as_str().to_string())
                .or_insert(0) += *count;
        }
        stats
    }

    /// Total number of injections.
    #[must_use]
    pub fn total_injections(&self) -> u64 {
        self.hits.lock().iter().sum()
    }
}

/// Builder for [`FaultInjector`].
#[derive(Debug)]
pub struct FaultInjectorBuilder {
    rng: DeterministicRng,
    configs: Vec<FaultConfig>,
}

impl FaultInjectorBuilder {
    /// Create a new builder with the given RNG.
    #[must_use]
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng,
            configs: Vec::new(),
        }
    }

    /// Add a fault configuration.
    #[must_use]
    pub fn with_fault(mut self, config: FaultConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Add the retryable key-value faults at the same probability.
    #[must_use]
    pub fn with_transient_kv_faults(self, probability: f64) -> Self {
        self.with_fault(FaultConfig::new(FaultType::KvThrottled, probability))
            .with_fault(FaultConfig::new(FaultType::KvServiceUnavailable, probability))
            .with_fault(FaultConfig::new(FaultType::KvTimeout, probability))
    }

    /// Build the injector.
    #[must_use]
    pub fn build(self) -> FaultInjector {
        let mut injector = FaultInjector::new(self.rng);
        for config in self.configs {
            injector.register(config);
        }
        injector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_faults_registered() {
        let injector = FaultInjector::disabled();
        for _ in 0..100 {
            assert!(injector.should_inject("kv_put_item").is_none());
        }
    }

    #[test]
    fn test_always_inject_with_filter() {
        let injector = FaultInjectorBuilder::new(DeterministicRng::new(42))
            .with_fault(FaultConfig::new(FaultType::KvThrottled, 1.0).with_filter("put"))
            .build();

        assert_eq!(
            injector.should_inject("kv_put_item"),
            Some(FaultType::KvThrottled)
        );
        assert!(injector.should_inject("kv_get_item").is_none());
    }

    #[test]
    fn test_max_injections() {
        let injector = FaultInjectorBuilder::new(DeterministicRng::new(42))
            .with_fault(FaultConfig::new(FaultType::KvTimeout, 1.0).with_max_injections(2))
            .build();

        assert!(injector.should_inject("op").is_some());
        assert!(injector.should_inject("op").is_some());
        assert!(injector.should_inject("op").is_none());
        assert_eq!(injector.total_injections(), 2);
        assert_eq!(injector.injection_stats().get("kv_timeout"), Some(&2));
    }

    #[test]
    fn test_probability_is_deterministic() {
        let run = |seed| {
            let injector = FaultInjectorBuilder::new(DeterministicRng::new(seed))
                .with_transient_kv_faults(0.3)
                .build();
            (0..50)
                .map(|_| injector.should_inject("kv_scan"))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_fault_errors_classified() {
        assert!(FaultType::KvThrottled.to_error("op").is_retryable());
        assert!(FaultType::KvServiceUnavailable.to_error("op").is_retryable());
        assert!(!FaultType::KvValidation.to_error("op").is_retryable());
        assert!(FaultType::KvResponseLost.to_error("op").is_transient());
        assert!(matches!(
            FaultType::DiskWriteFail.to_error("flush"),
            StorageError::Io { .. }
        ));
    }

    #[test]
    #[should_panic(expected = "probability must be in")]
    fn test_invalid_probability() {
        let _ = FaultConfig::new(FaultType::KvThrottled, 1.5);
    }
}
