// tests/reconciliation_tests.rs
//
// Cache/persistent-store agreement: suspension state in the coordination
// cache must match Cooldown status in the durable record, and one reconcile
// pass must repair any divergence.

mod common;

use common::TestPoolBuilder;
use keypool::coordination::CoordinationStore;
use keypool::storage::{AuditAction, KeyRepository, KeyStatus};
use std::time::Duration;
use tokio_test::assert_ok;

#[tokio::test]
async fn suspension_and_status_agree_after_a_report() {
    let pool = TestPoolBuilder::new().with_group("g", &["k1", "k2"]).build().await;

    pool.state.key_manager.report_outcome("k1", 429, None).await.unwrap();

    for key in ["k1", "k2"] {
        let suspended = pool.state.cooldown.is_suspended(key).await.unwrap();
        let status = pool.repo.get_key(key).await.unwrap().unwrap().status;
        assert_eq!(
            suspended,
            status == KeyStatus::Cooldown,
            "cache and store disagree for {key}"
        );
    }
}

#[tokio::test]
async fn orphaned_cooldown_is_resumed_by_one_sweep() {
    // a one-second cooldown whose cache entry expires while the persistent
    // status still says Cooldown: the crash/flush scenario
    let pool = TestPoolBuilder::new()
        .with_cooldown_seconds(1)
        .with_group("g", &["k1"])
        .build()
        .await;

    pool.state.key_manager.report_outcome("k1", 429, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // the cache entry is gone, the durable record is stale
    assert!(pool.coord.get("cooldown:k1").await.unwrap().is_none());
    assert_eq!(
        pool.repo.get_key("k1").await.unwrap().unwrap().status,
        KeyStatus::Cooldown
    );

    let report = pool.state.cooldown.reconcile().await.unwrap();
    assert_eq!(report.orphans, 1);

    let record = pool.repo.get_key("k1").await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Enabled);
    assert!(pool.state.cooldown.in_protection("k1").await.unwrap());

    let audit = pool.state.key_manager.audit_entries(Some("k1"), 10).await.unwrap();
    assert!(audit.iter().any(|e| e.action == AuditAction::CooldownEnd));
}

#[tokio::test]
async fn selection_read_heals_an_expired_entry_before_the_sweep() {
    let pool = TestPoolBuilder::new().with_group("g", &["k1"]).build().await;

    pool.state.key_manager.report_outcome("k1", 429, None).await.unwrap();

    // rewrite the entry with a past deadline and no physical TTL, so only the
    // logical check can notice it
    let past = chrono::Utc::now().timestamp() - 30;
    pool.coord
        .delete("cooldown:k1")
        .await
        .unwrap();
    pool.coord
        .set("cooldown:k1", &past.to_string(), None)
        .await
        .unwrap();

    assert!(!pool.state.cooldown.is_suspended("k1").await.unwrap());

    // recovery happened on the read, bounded by this caller, not the sweep
    let record = pool.repo.get_key("k1").await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Enabled);

    // and the key is selectable again right away
    let selected = pool.state.key_manager.get_key("g", None, None).await.unwrap();
    assert_eq!(selected.key, "k1");
}

#[tokio::test]
async fn sweep_leaves_healthy_state_untouched() {
    let pool = TestPoolBuilder::new().with_group("g", &["k1", "k2"]).build().await;

    pool.state.key_manager.report_outcome("k1", 429, None).await.unwrap();
    let before_k1 = pool.repo.get_key("k1").await.unwrap().unwrap();

    let report = assert_ok!(pool.state.cooldown.reconcile().await);
    assert_eq!(report.expired, 0);
    assert_eq!(report.orphans, 0);

    let after_k1 = pool.repo.get_key("k1").await.unwrap().unwrap();
    assert_eq!(before_k1.status, after_k1.status);
    assert!(pool.state.cooldown.is_suspended("k1").await.unwrap());
    assert!(!pool.state.cooldown.is_suspended("k2").await.unwrap());
}
