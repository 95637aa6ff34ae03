// src/lock.rs

//! Distributed mutual-exclusion primitive.
//!
//! Acquisition is a single atomic "set if absent, with expiry" storing a
//! caller-unique token; release is compare-then-delete so a holder whose TTL
//! already expired cannot release somebody else's acquisition. These are
//! best-effort mutexes, not consensus: when the coordination store is down,
//! locked operations fail closed.

use crate::coordination::CoordinationStore;
use crate::error::{AppError, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn CoordinationStore>,
    retry_delay: Duration,
}

impl LockService {
    pub fn new(store: Arc<dyn CoordinationStore>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    /// Try to take the lock, retrying up to `retry_count` times.
    ///
    /// Returns the holder token on success, `None` when the lock stayed
    /// contended through every attempt. Store failures propagate.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        retry_count: u32,
    ) -> Result<Option<String>> {
        let key = lock_key(name);
        let token = Uuid::new_v4().to_string();

        for attempt in 0..=retry_count {
            if self.store.set_if_absent(&key, &token, ttl).await? {
                trace!(lock = name, attempt, "Lock acquired");
                return Ok(Some(token));
            }
            if attempt < retry_count {
                // Jitter keeps a thundering herd of retries from re-colliding.
                let jitter_ms = rand::thread_rng().gen_range(0..=self.retry_delay.as_millis() as u64 / 2);
                tokio::time::sleep(self.retry_delay + Duration::from_millis(jitter_ms)).await;
            }
        }

        debug!(lock = name, attempts = retry_count + 1, "Lock contended, giving up");
        Ok(None)
    }

    /// Release the lock if `token` still holds it.
    pub async fn release(&self, name: &str, token: &str) -> Result<bool> {
        self.store.delete_if_equals(&lock_key(name), token).await
    }

    /// Run `f` while holding the named lock.
    ///
    /// The only locking entry point used by the pool: it guarantees a release
    /// attempt on every exit path, and a failed release never masks the
    /// closure's own result (the TTL reclaims the lock either way).
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl: Duration,
        retry_count: u32,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self
            .acquire(name, ttl, retry_count)
            .await?
            .ok_or_else(|| AppError::LockUnavailable {
                name: name.to_string(),
                attempts: retry_count + 1,
            })?;

        let result = f().await;

        match self.release(name, &token).await {
            Ok(true) => trace!(lock = name, "Lock released"),
            Ok(false) => debug!(lock = name, "Lock expired before release"),
            Err(e) => warn!(lock = name, error = %e, "Failed to release lock; TTL will reclaim it"),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> LockService {
        LockService::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn acquire_then_release() {
        let locks = service();
        let token = locks
            .acquire("getkey:eastus", Duration::from_secs(5), 0)
            .await
            .unwrap()
            .expect("uncontended lock should be acquired");
        assert!(locks.release("getkey:eastus", &token).await.unwrap());
        // second release is a no-op
        assert!(!locks.release("getkey:eastus", &token).await.unwrap());
    }

    #[tokio::test]
    async fn contended_lock_fails_after_retries() {
        let locks = service();
        let _held = locks
            .acquire("g", Duration::from_secs(30), 0)
            .await
            .unwrap()
            .unwrap();

        let got = locks.acquire("g", Duration::from_secs(30), 2).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn holder_cannot_release_after_reacquisition() {
        let locks = service();
        let stale = locks
            .acquire("g", Duration::from_millis(20), 0)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // someone else takes over after the TTL
        let fresh = locks
            .acquire("g", Duration::from_secs(30), 0)
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.release("g", &stale).await.unwrap());
        assert!(locks.release("g", &fresh).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let locks = service();

        let result: Result<()> = locks
            .with_lock("g", Duration::from_secs(30), 0, || async {
                Err(AppError::internal("boom"))
            })
            .await;
        assert!(result.is_err());

        // lock must be free again despite the error path
        let token = locks.acquire("g", Duration::from_secs(5), 0).await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn with_lock_surfaces_lock_unavailable() {
        let locks = service();
        let _held = locks
            .acquire("g", Duration::from_secs(30), 0)
            .await
            .unwrap()
            .unwrap();

        let calls = AtomicU32::new(0);
        let result: Result<()> = locks
            .with_lock("g", Duration::from_secs(30), 1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AppError::LockUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "closure must not run unprotected");
    }
}
