//! DST: Distributed Store Retries
//!
//! Deterministic fault injection against the in-process key-value client.
//! Time is paused, so backoff schedules are checked exactly without
//! waiting for them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use talkstore::{
    Collection, DeterministicRng, DistributedConfig, DistributedStore, FaultConfig,
    FaultInjectorBuilder, FaultType, Fields, RetryExecutor, RetryPolicy, SimKeyValueClient,
    StorageBackend, StorageError,
};
use tokio::time::Instant;

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

async fn store_with_faults(
    faults: Vec<FaultConfig>,
) -> (DistributedStore, Arc<SimKeyValueClient>, Arc<RetryExecutor>) {
    let mut builder = FaultInjectorBuilder::new(DeterministicRng::new(42));
    for fault in faults {
        builder = builder.with_fault(fault);
    }
    let config = DistributedConfig::default();
    let sim = Arc::new(SimKeyValueClient::with_fault_injector(Arc::new(builder.build())));
    sim.provision(|c| config.table_name(c));

    let executor = Arc::new(RetryExecutor::with_seed(RetryPolicy::default(), 42));
    let store = DistributedStore::new(config, sim.clone(), Arc::clone(&executor));
    store.initialize().await.unwrap();
    (store, sim, executor)
}

// =============================================================================
// RetryExecutor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success_within_backoff() {
    let executor = RetryExecutor::with_seed(RetryPolicy::default(), 7);
    let counter = AtomicU32::new(0);
    let attempts = &counter;

    let started = Instant::now();
    let result = executor
        .execute("put_item", move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::throttled("ProvisionedThroughputExceeded"))
            } else {
                Ok("stored")
            }
        })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.unwrap(), "stored");
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    // 100ms + 200ms, each plus at most 25% jitter.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(375), "elapsed {elapsed:?}");
    assert_eq!(executor.stats().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_after_max_retries_plus_one() {
    let executor = RetryExecutor::with_seed(RetryPolicy::default(), 7);
    let counter = AtomicU32::new(0);
    let attempts = &counter;

    let err = executor
        .execute("scan", move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::timeout("socket timeout"))
        })
        .await
        .unwrap_err();

    assert_eq!(counter.load(Ordering::SeqCst), 4);
    match err {
        StorageError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(last.is_transient());
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_not_retried() {
    let executor = RetryExecutor::with_seed(RetryPolicy::default(), 7);
    let counter = AtomicU32::new(0);
    let attempts = &counter;

    let err = executor
        .execute("put_item", move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::validation("bad expression"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Validation { .. }));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

// =============================================================================
// DistributedStore under faults
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_survives_throttling() {
    let (store, sim, executor) = store_with_faults(vec![FaultConfig::new(
        FaultType::KvThrottled,
        1.0,
    )
    .with_filter("put_item")
    .with_max_injections(2)])
    .await;

    let doc = store
        .create(Collection::Talks, fields(json!({"title": "Rust in 5 minutes"})))
        .await
        .unwrap();

    assert_eq!(sim.call_count("put_item"), 3);
    assert_eq!(executor.stats().retries, 2);
    let loaded = store.find_by_id(Collection::Talks, &doc.id).await.unwrap();
    assert_eq!(loaded, Some(doc));
}

#[tokio::test(start_paused = true)]
async fn test_create_retry_after_lost_response_is_not_duplicate() {
    let (store, sim, executor) = store_with_faults(vec![FaultConfig::new(
        FaultType::KvResponseLost,
        1.0,
    )
    .with_filter("put_item")
    .with_max_injections(1)])
    .await;

    let doc = store
        .create(Collection::Talks, fields(json!({"title": "Idempotent puts"})))
        .await
        .unwrap();

    // First put landed, its response was lost; the retry hit the condition.
    assert_eq!(sim.call_count("put_item"), 2);
    assert_eq!(executor.stats().retries, 1);
    let table = store.config().table_name(Collection::Talks);
    assert_eq!(sim.item_count(&table), 1);
    assert_eq!(store.find_by_id(Collection::Talks, &doc.id).await.unwrap(), Some(doc.clone()));

    let err = store
        .create(Collection::Talks, fields(json!({"id": doc.id, "title": "Someone else"})))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_read_exhausts_retries() {
    let (store, sim, _executor) = store_with_faults(vec![FaultConfig::new(
        FaultType::KvServiceUnavailable,
        1.0,
    )
    .with_filter("get_item")])
    .await;

    let err = store
        .find_by_id(Collection::Users, "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(sim.call_count("get_item"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_batch_insert_chunks() {
    let (store, sim, _executor) = store_with_faults(Vec::new()).await;

    let inputs = (0..63).map(|i| fields(json!({"page": i}))).collect();
    let docs = store.batch_insert(Collection::Analytics, inputs).await.unwrap();

    assert_eq!(docs.len(), 63);
    assert_eq!(sim.batch_write_sizes(), vec![25, 25, 13]);
    let table = store.config().table_name(Collection::Analytics);
    assert_eq!(sim.item_count(&table), 63);
}

#[tokio::test(start_paused = true)]
async fn test_batch_insert_resubmits_unprocessed_items() {
    let (store, sim, _executor) = store_with_faults(vec![FaultConfig::new(
        FaultType::KvUnprocessedItems,
        1.0,
    )
    .with_filter("batch_write")
    .with_max_injections(1)])
    .await;

    let inputs = (0..10).map(|i| fields(json!({"page": i}))).collect();
    store.batch_insert(Collection::Analytics, inputs).await.unwrap();

    let table = store.config().table_name(Collection::Analytics);
    assert_eq!(sim.item_count(&table), 10);
    assert!(sim.call_count("batch_write") >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_batch_insert_reports_partial_progress() {
    let (store, _sim, _executor) = store_with_faults(vec![FaultConfig::new(
        FaultType::KvTimeout,
        1.0,
    )
    .with_filter("batch_write")])
    .await;

    let inputs = (0..30).map(|i| fields(json!({"page": i}))).collect();
    let err = store
        .batch_insert(Collection::Analytics, inputs)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::PartialBatch {
            written: 0,
            total: 30,
            ..
        }
    ));
}
