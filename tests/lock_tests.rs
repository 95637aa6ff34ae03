// tests/lock_tests.rs

mod common;

use async_trait::async_trait;
use common::TestPoolBuilder;
use futures::future::join_all;
use keypool::coordination::{CoordinationStore, InMemoryCoordinationStore};
use keypool::error::{AppError, Result};
use keypool::lock::LockService;
use keypool::state::AppState;
use keypool::storage::{InMemoryKeyRepository, KeyRepository};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A coordination store that is permanently unreachable.
struct DownStore;

#[async_trait]
impl CoordinationStore for DownStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn delete_if_equals(&self, _key: &str, _expected: &str) -> Result<bool> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn acquire_slot(
        &self,
        _counter_key: &str,
        _lease_key: &str,
        _max: u32,
        _counter_ttl: Duration,
        _deadline: i64,
        _lease_ttl: Duration,
    ) -> Result<bool> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
    async fn release_slot(&self, _counter_key: &str, _lease_key: &str) -> Result<bool> {
        Err(AppError::CacheUnavailable {
            message: "connection refused".into(),
        })
    }
}

#[tokio::test]
async fn cross_instance_mutual_exclusion() {
    // two lock services over one store stand in for two process instances
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let instance_a = LockService::new(store.clone(), Duration::from_millis(5));
    let instance_b = LockService::new(store, Duration::from_millis(5));

    let in_critical = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for i in 0..10 {
        let locks = if i % 2 == 0 {
            instance_a.clone()
        } else {
            instance_b.clone()
        };
        let in_critical = in_critical.clone();
        let overlaps = overlaps.clone();
        let completed = completed.clone();

        tasks.push(tokio::spawn(async move {
            locks
                .with_lock("getkey:eastus", Duration::from_secs(5), 50, || async {
                    if in_critical.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_critical.store(false, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }

    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "critical sections overlapped");
    assert_eq!(completed.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn selection_fails_closed_when_cache_is_down() {
    let coord: Arc<dyn CoordinationStore> = Arc::new(DownStore);
    let repo: Arc<dyn KeyRepository> = Arc::new(InMemoryKeyRepository::new());
    repo.add_key(keypool::storage::NewKey::new("k1", "eastus"))
        .await
        .unwrap();

    let state = AppState::with_stores(keypool::AppConfig::default(), coord, repo)
        .await
        .unwrap();

    let err = state
        .key_manager
        .get_key("eastus", None, None)
        .await
        .unwrap_err();

    // never "assume unsuspended": the failure surfaces instead of a pick
    assert!(
        matches!(err, AppError::CacheUnavailable { .. }),
        "expected CacheUnavailable, got {err:?}"
    );
}

#[tokio::test]
async fn lock_contention_surfaces_as_retryable_conflict() {
    let pool = TestPoolBuilder::new().with_group("g", &["k1"]).build().await;

    // hold the selection lock the way a stalled instance would
    let locks = LockService::new(
        pool.coord.clone() as Arc<dyn CoordinationStore>,
        Duration::from_millis(5),
    );
    let _token = locks
        .acquire("getkey:g", Duration::from_secs(30), 0)
        .await
        .unwrap()
        .unwrap();

    let err = pool
        .state
        .key_manager
        .get_key("g", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::LockUnavailable { .. }));
    assert!(err.is_retryable());
}
