//! Storage Errors
//!
//! `TigerStyle`: Explicit error types with context.
//!
//! Programmer errors (unknown collection, missing id, bad configuration) are
//! never retried. Only [`StorageError::Transient`] is retryable; once the
//! retry budget is spent it surfaces as [`StorageError::RetriesExhausted`].

use std::fmt;

use thiserror::Error;

/// Kind of a transient backend fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// Throughput exceeded / request throttled
    Throttled,
    /// Service temporarily unavailable (5xx)
    ServiceUnavailable,
    /// Request or socket timeout
    Timeout,
    /// Connection dropped or refused
    Connection,
}

impl TransientKind {
    /// Get the kind name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Operation invoked while the store is not ready
    #[error("store not initialized (state: {state})")]
    NotInitialized {
        /// Lifecycle state at the time of the call
        state: String,
    },

    /// Collection name outside the fixed set
    #[error("invalid collection: {name}")]
    InvalidCollection {
        /// The rejected name
        name: String,
    },

    /// Document not found
    #[error("document not found: {collection}/{id}")]
    NotFound {
        /// Collection searched
        collection: String,
        /// Missing document id
        id: String,
    },

    /// Document id already exists
    #[error("duplicate key: {collection}/{id}")]
    DuplicateKey {
        /// Collection written
        collection: String,
        /// Conflicting id
        id: String,
    },

    /// Bad input or configuration
    #[error("validation error: {message}")]
    Validation {
        /// Validation error message
        message: String,
    },

    /// A conditional write expression was not satisfied
    #[error("conditional check failed: {message}")]
    ConditionalCheckFailed {
        /// Condition that failed
        message: String,
    },

    /// Retryable backend fault
    #[error("transient backend error ({kind}): {message}")]
    Transient {
        /// Fault category
        kind: TransientKind,
        /// Error message
        message: String,
    },

    /// Retries exhausted; wraps the last observed cause
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Total attempts made
        attempts: u32,
        /// Last error observed
        last: Box<StorageError>,
    },

    /// A chunked batch stopped part-way; earlier chunks stay committed
    #[error("batch write stopped after {written} of {total} items: {cause}")]
    PartialBatch {
        /// Items committed before the failure
        written: usize,
        /// Items requested
        total: usize,
        /// Error of the failing chunk
        cause: Box<StorageError>,
    },

    /// Non-retryable backend failure
    #[error("permanent backend error: {message}")]
    Permanent {
        /// Error message
        message: String,
    },

    /// Collection lock not acquired in time
    #[error("lock timeout on {collection} after {waited_ms}ms")]
    LockTimeout {
        /// Locked collection
        collection: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Filesystem error
    #[error("io error: {message}")]
    Io {
        /// Error message
        message: String,
    },

    /// Encoding or decoding failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl StorageError {
    /// Create a not-initialized error.
    #[must_use]
    pub fn not_initialized(state: impl fmt::Display) -> Self {
        Self::NotInitialized {
            state: state.to_string(),
        }
    }

    /// Create an invalid collection error.
    #[must_use]
    pub fn invalid_collection(name: impl Into<String>) -> Self {
        Self::InvalidCollection { name: name.into() }
    }

    /// Create a not found error.
    #[must_use]
    pub fn not_found(collection: impl fmt::Display, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.into(),
        }
    }

    /// Create a duplicate key error.
    #[must_use]
    pub fn duplicate_key(collection: impl fmt::Display, id: impl Into<String>) -> Self {
        Self::DuplicateKey {
            collection: collection.to_string(),
            id: id.into(),
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a conditional check failure.
    #[must_use]
    pub fn conditional_check_failed(message: impl Into<String>) -> Self {
        Self::ConditionalCheckFailed {
            message: message.into(),
        }
    }

    /// Create a transient error.
    #[must_use]
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Create a throttling error.
    #[must_use]
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Throttled, message)
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Timeout, message)
    }

    /// Create a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Connection, message)
    }

    /// Create a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Create a lock timeout error.
    #[must_use]
    pub fn lock_timeout(collection: impl fmt::Display, waited_ms: u64) -> Self {
        Self::LockTimeout {
            collection: collection.to_string(),
            waited_ms,
        }
    }

    /// Create an io error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a transient error (can be retried).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Check if the retry executor should try again after this error.
    ///
    /// Conditional-check failures, validation errors and every programmer
    /// error return `false`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    /// Strip retry bookkeeping and return the last underlying cause.
    #[must_use]
    pub fn into_last_error(self) -> Self {
        match self {
            Self::RetriesExhausted { last, .. } => last.into_last_error(),
            other => other,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = StorageError::not_found("events", "e-1");
        assert!(
            matches!(err, StorageError::NotFound { ref collection, ref id } if collection == "events" && id == "e-1")
        );
        assert_eq!(err.to_string(), "document not found: events/e-1");

        let err = StorageError::validation("DATABASE_URL is required");
        assert!(
            matches!(err, StorageError::Validation { message } if message == "DATABASE_URL is required")
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(StorageError::throttled("slow down").is_retryable());
        assert!(StorageError::timeout("ETIMEDOUT").is_retryable());
        assert!(StorageError::connection("reset").is_retryable());
        assert!(
            StorageError::transient(TransientKind::ServiceUnavailable, "503").is_retryable()
        );

        assert!(!StorageError::validation("bad").is_retryable());
        assert!(!StorageError::conditional_check_failed("attribute_exists(id)").is_retryable());
        assert!(!StorageError::not_found("events", "x").is_retryable());
        assert!(!StorageError::duplicate_key("events", "x").is_retryable());
        assert!(!StorageError::invalid_collection("nope").is_retryable());
    }

    #[test]
    fn test_exhausted_is_not_retryable() {
        let err = StorageError::RetriesExhausted {
            attempts: 4,
            last: Box::new(StorageError::throttled("slow down")),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_into_last_error() {
        let err = StorageError::RetriesExhausted {
            attempts: 4,
            last: Box::new(StorageError::timeout("socket")),
        };
        let last = err.into_last_error();
        assert!(matches!(
            last,
            StorageError::Transient {
                kind: TransientKind::Timeout,
                ..
            }
        ));

        let plain = StorageError::validation("x").into_last_error();
        assert!(matches!(plain, StorageError::Validation { .. }));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io { .. }));
    }
}
