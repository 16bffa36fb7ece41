//! Integration: StorageFactory and StorageHandle
//!
//! Backend construction from configuration and recycling on change.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use talkstore::{
    BackendKind, Collection, EmbeddedConfig, Fields, Filter, SimKeyValueClient,
    StorageConfig, StorageError, StorageFactory, StorageHandle, StoreState,
};
use tempfile::TempDir;

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_reconfigure_closes_old_before_opening_new() {
    let dir = TempDir::new().unwrap();
    let slow = StorageConfig::default()
        .with_embedded(EmbeddedConfig::new(dir.path()).with_save_debounce(Duration::from_secs(60)));
    let handle = StorageHandle::open(StorageFactory::new(), slow).await.unwrap();

    let old = handle.backend();
    let event = old
        .create(Collection::Events, fields(json!({"title": "Before switch"})))
        .await
        .unwrap();

    // Same directory, different settings: the new store can only see the
    // event if the old one flushed on close before the new one loaded.
    let fast = StorageConfig::default()
        .with_embedded(EmbeddedConfig::new(dir.path()).with_save_debounce(Duration::from_millis(10)));
    assert!(handle.reconfigure(fast.clone()).await.unwrap());

    assert_eq!(old.health().await.unwrap().state, StoreState::Closed);
    let new = handle.backend();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.health().await.unwrap().state, StoreState::Ready);
    assert!(new.find_by_id(Collection::Events, &event.id).await.unwrap().is_some());
    assert_eq!(handle.config().await, fast);

    let err = old.find(Collection::Events, &Filter::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::NotInitialized { .. }));

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_reconfigure_leaves_closed_backend() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig::default().with_embedded(EmbeddedConfig::new(dir.path()));
    let handle = StorageHandle::open(StorageFactory::new(), config.clone())
        .await
        .unwrap();

    // No connection string: construction or initialization fails.
    let broken = config.with_backend(BackendKind::Relational);
    assert!(handle.reconfigure(broken).await.is_err());

    let err = handle
        .backend()
        .find(Collection::Events, &Filter::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotInitialized { .. }));
}

#[tokio::test]
async fn test_switch_to_distributed_with_injected_client() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig::default().with_embedded(EmbeddedConfig::new(dir.path()));

    let client = Arc::new(SimKeyValueClient::new());
    let distributed = config.clone().with_backend(BackendKind::Distributed);
    client.provision(|c| distributed.distributed.table_name(c));

    let factory = StorageFactory::new().with_kv_client(client.clone());
    let handle = StorageHandle::open(factory, config).await.unwrap();
    assert_eq!(handle.backend().kind(), BackendKind::Embedded);

    assert!(handle.reconfigure(distributed).await.unwrap());
    let backend = handle.backend();
    assert_eq!(backend.kind(), BackendKind::Distributed);

    let talk = backend
        .create(Collection::Talks, fields(json!({"title": "Conditional writes", "eventId": "evt-1"})))
        .await
        .unwrap();
    let for_event = backend
        .find(Collection::Talks, &Filter::new().eq("eventId", "evt-1"))
        .await
        .unwrap();
    assert_eq!(for_event, vec![talk]);
    assert!(client.call_count("query_index") >= 1);

    handle.close().await.unwrap();
}
