//! RetryExecutor - exponential backoff with jitter.
//!
//! `TigerStyle`: Bounded retries, explicit classification.
//!
//! ```text
//! delay(attempt) = min(max_delay, base_delay * 2^attempt + jitter)
//! jitter         ~ uniform[0, 0.25 * base_delay * 2^attempt]
//! ```
//!
//! An operation runs at most `max_retries + 1` times. Only
//! [`StorageError::is_retryable`] errors are retried; anything else is
//! returned unchanged on first sight.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::constants::{
    DISTRIBUTED_BATCH_ITEMS_COUNT_MAX, STORAGE_RETRY_COUNT_LIMIT, STORAGE_RETRY_COUNT_MAX,
    STORAGE_RETRY_DELAY_MS_BASE, STORAGE_RETRY_DELAY_MS_MAX, STORAGE_RETRY_JITTER_RATIO,
};
use crate::distributed::{Item, KeyValueClient};
use crate::dst::DeterministicRng;
use crate::error::{StorageError, StorageResult};

// =============================================================================
// RetryPolicy
// =============================================================================

/// Parameters governing backoff on transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry (before jitter)
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: STORAGE_RETRY_COUNT_MAX,
            base_delay: Duration::from_millis(STORAGE_RETRY_DELAY_MS_BASE),
            max_delay: Duration::from_millis(STORAGE_RETRY_DELAY_MS_MAX),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set additional attempts.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Total attempts allowed.
    #[must_use]
    pub fn attempts_max(&self) -> u32 {
        self.max_retries + 1
    }

    /// `base_delay * 2^attempt`, saturating.
    #[must_use]
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Inclusive bounds of the delay before retry `attempt` (0-based).
    #[must_use]
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let exp = self.exponential_delay(attempt);
        let upper = exp.saturating_add(exp.mul_f64(STORAGE_RETRY_JITTER_RATIO));
        (exp.min(self.max_delay), upper.min(self.max_delay))
    }

    /// Worst-case time spent sleeping before giving up.
    #[must_use]
    pub fn total_delay_max(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_bounds(attempt).1)
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    /// Returns `Validation` if limits are out of range.
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_retries > STORAGE_RETRY_COUNT_LIMIT {
            return Err(StorageError::validation(format!(
                "max_retries must be <= {STORAGE_RETRY_COUNT_LIMIT}, got {}",
                self.max_retries
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(StorageError::validation(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

// =============================================================================
// RetryExecutor
// =============================================================================

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Operations executed
    pub operations: u64,
    /// Retries performed
    pub retries: u64,
    /// Operations that ran out of retries
    pub exhausted: u64,
}

/// Summary of a chunked batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriteReport {
    /// Chunks committed
    pub chunks: usize,
    /// Items committed
    pub items_written: usize,
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    rng: Mutex<DeterministicRng>,
    operations: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl RetryExecutor {
    /// Executor with entropy-seeded jitter.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, DeterministicRng::from_entropy())
    }

    /// Executor with reproducible jitter.
    #[must_use]
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, DeterministicRng::new(seed))
    }

    /// Executor drawing jitter from `rng`.
    #[must_use]
    pub fn with_rng(policy: RetryPolicy, rng: DeterministicRng) -> Self {
        Self {
            policy,
            rng: Mutex::new(rng),
            operations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            operations: self.operations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Delay before retry `attempt` (0-based), jitter included.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.policy.exponential_delay(attempt);
        let fraction = self.rng.lock().next_float_upto(STORAGE_RETRY_JITTER_RATIO);
        exp.saturating_add(exp.mul_f64(fraction))
            .min(self.policy.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// # Errors
    /// Non-retryable errors are returned unchanged. Exhaustion returns
    /// [`StorageError::RetriesExhausted`] wrapping the last cause.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let mut attempt: u32 = 0;

        loop {
            let error = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, retries = attempt, "operation succeeded after {attempt} retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if attempt >= self.policy.max_retries {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    operation,
                    attempts = attempt + 1,
                    error = %error,
                    "retries exhausted"
                );
                return Err(StorageError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(error),
                });
            }

            let delay = self.backoff_delay(attempt);
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                attempts_max = self.policy.attempts_max(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying after transient error"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Write `items` in chunks of `chunk_size`, retrying each chunk on its own.
    ///
    /// Items the service reports as unprocessed are resubmitted under the
    /// same backoff schedule. A failing chunk stops the batch; earlier chunks
    /// remain committed.
    ///
    /// # Errors
    /// `Validation` for an out-of-range chunk size; `PartialBatch` when a
    /// chunk fails after retries.
    #[tracing::instrument(skip(self, client, items), fields(total = items.len()))]
    pub async fn batch_write_with_retry(
        &self,
        client: &dyn KeyValueClient,
        table: &str,
        items: Vec<Item>,
        chunk_size: usize,
    ) -> StorageResult<BatchWriteReport> {
        // Precondition
        if chunk_size == 0 || chunk_size > DISTRIBUTED_BATCH_ITEMS_COUNT_MAX {
            return Err(StorageError::validation(format!(
                "chunk size must be in 1..={DISTRIBUTED_BATCH_ITEMS_COUNT_MAX}, got {chunk_size}"
            )));
        }

        let total = items.len();
        let chunk_count = total.div_ceil(chunk_size);
        let mut report = BatchWriteReport::default();

        for (index, chunk) in items.chunks(chunk_size).enumerate() {
            if let Err(cause) = self.write_chunk(client, table, chunk.to_vec()).await {
                tracing::error!(
                    table,
                    chunk = index + 1,
                    chunks = chunk_count,
                    written = report.items_written,
                    total,
                    error = %cause,
                    "batch chunk failed"
                );
                return Err(StorageError::PartialBatch {
                    written: report.items_written,
                    total,
                    cause: Box::new(cause),
                });
            }
            report.chunks += 1;
            report.items_written += chunk.len();
            tracing::info!(
                table,
                chunk = index + 1,
                chunks = chunk_count,
                "batch wrote {} items ({}/{})",
                chunk.len(),
                report.items_written,
                total
            );
        }

        // Postcondition
        assert_eq!(report.items_written, total, "every item must be written");
        Ok(report)
    }

    async fn write_chunk(
        &self,
        client: &dyn KeyValueClient,
        table: &str,
        chunk: Vec<Item>,
    ) -> StorageResult<()> {
        let mut pending = chunk;
        let mut round: u32 = 0;

        loop {
            let unprocessed = self
                .execute("batch_write", || client.batch_write(table, pending.clone()))
                .await?;
            if unprocessed.is_empty() {
                return Ok(());
            }

            if round >= self.policy.max_retries {
                return Err(StorageError::RetriesExhausted {
                    attempts: round + 1,
                    last: Box::new(StorageError::throttled(format!(
                        "{} items left unprocessed",
                        unprocessed.len()
                    ))),
                });
            }
            let delay = self.backoff_delay(round);
            tracing::warn!(
                table,
                unprocessed = unprocessed.len(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "resubmitting unprocessed items"
            );
            tokio::time::sleep(delay).await;
            pending = unprocessed;
            round += 1;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
