// src/cooldown.rs

//! Cooldown / health coordination state.
//!
//! Tracks per-key suspensions, the short anti-flapping protection window that
//! follows them, the sticky active-key marker per routing group and the
//! round-robin cursors. The persistent store stays authoritative: a cache
//! entry that disagrees with it is repaired either on the next read
//! (`is_suspended` self-heals) or by the reconcile sweep.

use crate::coordination::CoordinationStore;
use crate::error::Result;
use crate::events::HealthEventBus;
use crate::storage::{key_preview, AuditAction, KeyRepository, KeyStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn cooldown_key(key: &str) -> String {
    format!("cooldown:{key}")
}

fn protection_key(key: &str) -> String {
    format!("protect:{key}")
}

fn active_marker_key(group: &str) -> String {
    format!("active:{group}")
}

fn cursor_key(group: &str, tier: &str) -> String {
    format!("cursor:{group}:{tier}")
}

/// Summary of one reconcile pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Cache entries found logically expired and resumed.
    pub expired: u32,
    /// Persistent Cooldown-status keys with no cache entry, resumed.
    pub orphans: u32,
}

pub struct CooldownManager {
    store: Arc<dyn CoordinationStore>,
    repo: Arc<dyn KeyRepository>,
    events: Arc<HealthEventBus>,
    protection_ttl: Duration,
}

impl CooldownManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        repo: Arc<dyn KeyRepository>,
        events: Arc<HealthEventBus>,
        protection_ttl: Duration,
    ) -> Self {
        Self {
            store,
            repo,
            events,
            protection_ttl,
        }
    }

    /// Suspend a key for `seconds`.
    ///
    /// Idempotent-safe: an existing entry keeps its original deadline. Callers
    /// check status before suspending; a second trigger must not extend the
    /// timer.
    pub async fn suspend(&self, key: &str, seconds: u64) -> Result<()> {
        let cache_key = cooldown_key(key);
        if self.store.get(&cache_key).await?.is_some() {
            debug!(key.preview = %key_preview(key), "Key already suspended, keeping existing deadline");
            return Ok(());
        }

        let deadline = Utc::now().timestamp() + seconds as i64;
        self.store
            .set(
                &cache_key,
                &deadline.to_string(),
                Some(Duration::from_secs(seconds)),
            )
            .await?;
        info!(
            key.preview = %key_preview(key),
            cooldown_secs = seconds,
            "Key suspended"
        );
        Ok(())
    }

    /// Remove the suspension entry and open the protection window.
    pub async fn resume(&self, key: &str) -> Result<()> {
        self.store.delete(&cooldown_key(key)).await?;
        self.start_protection(key).await?;
        Ok(())
    }

    /// The self-healing read path.
    ///
    /// A logically-expired entry (the deadline passed but the entry is still
    /// present) is deleted, protection starts, and the persistent record is
    /// moved back to Enabled immediately, so recovery latency is bounded by
    /// the caller's own read instead of the sweep interval.
    pub async fn is_suspended(&self, key: &str) -> Result<bool> {
        let Some(raw) = self.store.get(&cooldown_key(key)).await? else {
            return Ok(false);
        };

        let deadline: i64 = raw.parse().unwrap_or(0);
        if Utc::now().timestamp() < deadline {
            return Ok(true);
        }

        self.reactivate(key, "cooldown expired").await?;
        Ok(false)
    }

    /// Protection is a pure TTL marker; existence is the whole check.
    pub async fn in_protection(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(&protection_key(key)).await?.is_some())
    }

    /// Seconds left on a suspension, `None` when the key is not suspended.
    /// Read-only: expiry repair is left to `is_suspended` and the sweep.
    pub async fn remaining_seconds(&self, key: &str) -> Result<Option<i64>> {
        let Some(raw) = self.store.get(&cooldown_key(key)).await? else {
            return Ok(None);
        };
        let deadline: i64 = raw.parse().unwrap_or(0);
        let remaining = deadline - Utc::now().timestamp();
        Ok((remaining > 0).then_some(remaining))
    }

    pub async fn active_key(&self, group: &str) -> Result<Option<String>> {
        self.store.get(&active_marker_key(group)).await
    }

    pub async fn set_active_key(&self, group: &str, key: &str) -> Result<()> {
        self.store.set(&active_marker_key(group), key, None).await
    }

    /// Clear the group's sticky marker only while it still names `key`, so a
    /// marker already repointed at another key is left alone.
    pub async fn clear_active_key(&self, group: &str, key: &str) -> Result<bool> {
        self.store
            .delete_if_equals(&active_marker_key(group), key)
            .await
    }

    /// Read and advance the round-robin cursor for `(group, tier)`.
    ///
    /// Best-effort by design: losing the cursor only costs fairness, so
    /// failures degrade to index zero with a warning instead of failing the
    /// selection.
    pub async fn advance_cursor(
        &self,
        group: &str,
        tier: &str,
        len: usize,
        ttl: Duration,
    ) -> usize {
        debug_assert!(len > 0);
        let cache_key = cursor_key(group, tier);

        let index = match self.store.get(&cache_key).await {
            Ok(value) => value.and_then(|v| v.parse::<usize>().ok()).unwrap_or(0) % len,
            Err(e) => {
                warn!(group, tier, error = %e, "Failed to read rotation cursor, starting from zero");
                0
            }
        };

        let next = (index + 1) % len;
        if let Err(e) = self.store.set(&cache_key, &next.to_string(), Some(ttl)).await {
            warn!(group, tier, error = %e, "Failed to advance rotation cursor");
        }
        index
    }

    /// Drop every cache entry referencing a deleted key.
    pub async fn forget(&self, key: &str, group: &str) -> Result<()> {
        self.store.delete(&cooldown_key(key)).await?;
        self.store.delete(&protection_key(key)).await?;
        self.clear_active_key(group, key).await?;
        Ok(())
    }

    async fn start_protection(&self, key: &str) -> Result<()> {
        self.store
            .set(&protection_key(key), "1", Some(self.protection_ttl))
            .await
    }

    /// End a suspension: drop the entry, open protection, and move the
    /// persistent record Cooldown → Enabled.
    ///
    /// Runs without the per-key status lock; the conditional transition is
    /// the atomicity point, so a concurrent disable always wins.
    async fn reactivate(&self, key: &str, reason: &str) -> Result<()> {
        self.store.delete(&cooldown_key(key)).await?;
        self.start_protection(key).await?;

        let updated = self
            .repo
            .transition_status(
                key,
                Some(KeyStatus::Cooldown),
                KeyStatus::Enabled,
                AuditAction::CooldownEnd,
                None,
                Some(reason),
                false,
            )
            .await?;

        if updated.is_some() {
            info!(key.preview = %key_preview(key), reason, "Key resumed from cooldown");
            self.events.emit(key, KeyStatus::Cooldown, KeyStatus::Enabled);
        }
        Ok(())
    }

    /// One reconciliation pass.
    ///
    /// The read path only fires when somebody queries that key; the sweep
    /// guarantees eventual correction for idle keys and for orphans left by a
    /// cache flush or a crash mid-suspension.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for cache_key in self.store.keys_with_prefix("cooldown:").await? {
            let Some(key) = cache_key.strip_prefix("cooldown:") else {
                continue;
            };
            let expired = match self.store.get(&cache_key).await {
                Ok(Some(raw)) => {
                    let deadline: i64 = raw.parse().unwrap_or(0);
                    Utc::now().timestamp() >= deadline
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(key.preview = %key_preview(key), error = %e, "Reconcile read failed");
                    false
                }
            };
            if expired {
                if let Err(e) = self.reactivate(key, "cooldown expired").await {
                    warn!(key.preview = %key_preview(key), error = %e, "Failed to resume expired key");
                } else {
                    report.expired += 1;
                }
            }
        }

        for record in self.repo.keys_with_status(KeyStatus::Cooldown).await? {
            match self.store.get(&cooldown_key(&record.key)).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = self.reactivate(&record.key, "orphaned cooldown").await {
                        warn!(
                            key.preview = %record.preview(),
                            error = %e,
                            "Failed to resume orphaned key"
                        );
                    } else {
                        report.orphans += 1;
                    }
                }
                Err(e) => {
                    warn!(key.preview = %record.preview(), error = %e, "Reconcile read failed");
                }
            }
        }

        if report.expired > 0 || report.orphans > 0 {
            info!(
                expired = report.expired,
                orphans = report.orphans,
                "Cooldown reconciliation corrected state"
            );
        }
        Ok(report)
    }

    /// Spawn the background reconcile loop.
    pub fn spawn_sweep(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // skip the immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile().await {
                    warn!(error = %e, "Cooldown reconciliation pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use crate::storage::{InMemoryKeyRepository, NewKey};

    struct Fixture {
        store: Arc<InMemoryCoordinationStore>,
        repo: Arc<InMemoryKeyRepository>,
        cooldown: CooldownManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let repo = Arc::new(InMemoryKeyRepository::new());
        let cooldown = CooldownManager::new(
            store.clone(),
            repo.clone(),
            Arc::new(HealthEventBus::new()),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            repo,
            cooldown,
        }
    }

    async fn seed_cooldown_key(f: &Fixture, key: &str) {
        f.repo.add_key(NewKey::new(key, "eastus")).await.unwrap();
        f.repo
            .transition_status(
                key,
                None,
                KeyStatus::Cooldown,
                AuditAction::CooldownStart,
                Some(429),
                None,
                true,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn suspend_and_query() {
        let f = fixture();
        f.cooldown.suspend("secret1", 300).await.unwrap();
        assert!(f.cooldown.is_suspended("secret1").await.unwrap());
        let remaining = f.cooldown.remaining_seconds("secret1").await.unwrap().unwrap();
        assert!(remaining > 290 && remaining <= 300);
    }

    #[tokio::test]
    async fn second_suspend_keeps_deadline() {
        let f = fixture();
        f.cooldown.suspend("secret1", 10).await.unwrap();
        f.cooldown.suspend("secret1", 600).await.unwrap();
        let remaining = f.cooldown.remaining_seconds("secret1").await.unwrap().unwrap();
        assert!(remaining <= 10, "second suspend must not extend the deadline");
    }

    #[tokio::test]
    async fn read_path_self_heals_expired_entry() {
        let f = fixture();
        seed_cooldown_key(&f, "secret1").await;
        // plant a logically-expired entry with no physical TTL
        let past = Utc::now().timestamp() - 10;
        f.store
            .set("cooldown:secret1", &past.to_string(), None)
            .await
            .unwrap();

        assert!(!f.cooldown.is_suspended("secret1").await.unwrap());

        // entry removed, protection started, record re-enabled
        assert!(f.store.get("cooldown:secret1").await.unwrap().is_none());
        assert!(f.cooldown.in_protection("secret1").await.unwrap());
        let record = f.repo.get_key("secret1").await.unwrap().unwrap();
        assert_eq!(record.status, KeyStatus::Enabled);
    }

    #[tokio::test]
    async fn reconcile_resumes_orphans() {
        let f = fixture();
        seed_cooldown_key(&f, "secret1").await;
        // no cache entry at all: orphaned suspension

        let report = f.cooldown.reconcile().await.unwrap();
        assert_eq!(report.orphans, 1);

        let record = f.repo.get_key("secret1").await.unwrap().unwrap();
        assert_eq!(record.status, KeyStatus::Enabled);
        assert!(f.cooldown.in_protection("secret1").await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_resumes_logically_expired_entries() {
        let f = fixture();
        seed_cooldown_key(&f, "secret1").await;
        let past = Utc::now().timestamp() - 1;
        f.store
            .set("cooldown:secret1", &past.to_string(), None)
            .await
            .unwrap();

        let report = f.cooldown.reconcile().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(
            f.repo.get_key("secret1").await.unwrap().unwrap().status,
            KeyStatus::Enabled
        );
    }

    #[tokio::test]
    async fn reconcile_leaves_live_suspensions_alone() {
        let f = fixture();
        seed_cooldown_key(&f, "secret1").await;
        f.cooldown.suspend("secret1", 300).await.unwrap();

        let report = f.cooldown.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert!(f.cooldown.is_suspended("secret1").await.unwrap());
        assert_eq!(
            f.repo.get_key("secret1").await.unwrap().unwrap().status,
            KeyStatus::Cooldown
        );
    }

    #[tokio::test]
    async fn active_marker_clear_is_conditional() {
        let f = fixture();
        f.cooldown.set_active_key("eastus", "secret1").await.unwrap();
        assert!(!f.cooldown.clear_active_key("eastus", "secret2").await.unwrap());
        assert_eq!(
            f.cooldown.active_key("eastus").await.unwrap().as_deref(),
            Some("secret1")
        );
        assert!(f.cooldown.clear_active_key("eastus", "secret1").await.unwrap());
        assert!(f.cooldown.active_key("eastus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cursor_advances_modulo_len() {
        let f = fixture();
        let ttl = Duration::from_secs(60);
        assert_eq!(f.cooldown.advance_cursor("eastus", "normal", 3, ttl).await, 0);
        assert_eq!(f.cooldown.advance_cursor("eastus", "normal", 3, ttl).await, 1);
        assert_eq!(f.cooldown.advance_cursor("eastus", "normal", 3, ttl).await, 2);
        assert_eq!(f.cooldown.advance_cursor("eastus", "normal", 3, ttl).await, 0);
        // shrinking the candidate list shrinks the modulus
        assert_eq!(f.cooldown.advance_cursor("eastus", "normal", 2, ttl).await, 1);
    }

    #[tokio::test]
    async fn manual_resume_opens_protection() {
        let f = fixture();
        f.cooldown.suspend("secret1", 300).await.unwrap();
        f.cooldown.resume("secret1").await.unwrap();
        assert!(!f.cooldown.is_suspended("secret1").await.unwrap());
        assert!(f.cooldown.in_protection("secret1").await.unwrap());
    }
}
