// src/admission.rs

//! Concurrency admission control.
//!
//! Tracks in-flight requests per key and rejects work once a configurable
//! ceiling is reached. Each admitted request holds an individually TTL'd
//! lease; a periodic sweep reclaims slots whose callers crashed or forgot to
//! release. Lease lifetimes are decoupled from lock TTLs because a lease
//! spans the whole external call.

use crate::coordination::CoordinationStore;
use crate::error::Result;
use crate::storage::key_preview;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LEASE_PREFIX: &str = "admission:lease:";

fn counter_key(key: &str) -> String {
    format!("admission:count:{key}")
}

fn lease_cache_key(key: &str, lease_id: &str) -> String {
    format!("{LEASE_PREFIX}{key}:{lease_id}")
}

#[derive(Clone)]
pub struct ConcurrencyLimiter {
    store: Arc<dyn CoordinationStore>,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Try to admit one request for `key`.
    ///
    /// Returns a lease id on admission, `None` once `max_concurrent` requests
    /// are already in flight (the caller surfaces that as `TooManyRequests`,
    /// distinct from "no key available").
    pub async fn try_acquire(
        &self,
        key: &str,
        max_concurrent: u32,
        lease_timeout: Duration,
    ) -> Result<Option<String>> {
        let lease_id = Uuid::new_v4().to_string();
        let deadline = Utc::now().timestamp() + lease_timeout.as_secs() as i64;

        // The physical TTL is a backstop at twice the logical deadline, so
        // the sweep sees (and accounts for) expired leases before the cache
        // quietly drops them.
        let admitted = self
            .store
            .acquire_slot(
                &counter_key(key),
                &lease_cache_key(key, &lease_id),
                max_concurrent,
                lease_timeout,
                deadline,
                lease_timeout * 2,
            )
            .await?;

        if admitted {
            debug!(
                key.preview = %key_preview(key),
                lease_id = %lease_id,
                "Request admitted"
            );
            Ok(Some(lease_id))
        } else {
            debug!(
                key.preview = %key_preview(key),
                limit = max_concurrent,
                "Concurrency ceiling reached"
            );
            Ok(None)
        }
    }

    /// Release an admitted request. Returns false when the lease was already
    /// gone (double release, or reclaimed by the sweep).
    pub async fn release(&self, key: &str, lease_id: &str) -> Result<bool> {
        self.store
            .release_slot(&counter_key(key), &lease_cache_key(key, lease_id))
            .await
    }

    /// Current in-flight count for a key.
    pub async fn in_flight(&self, key: &str) -> Result<u32> {
        Ok(self
            .store
            .get(&counter_key(key))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Reclaim slots for leases whose logical deadline has passed.
    pub async fn reap_expired(&self) -> Result<u32> {
        let mut reclaimed = 0;
        let now = Utc::now().timestamp();

        for lease_key in self.store.keys_with_prefix(LEASE_PREFIX).await? {
            let deadline: i64 = match self.store.get(&lease_key).await {
                Ok(Some(raw)) => raw.parse().unwrap_or(0),
                Ok(None) => continue,
                Err(e) => {
                    warn!(lease = %lease_key, error = %e, "Lease sweep read failed");
                    continue;
                }
            };
            if now < deadline {
                continue;
            }

            // lease key layout: admission:lease:<api key>:<uuid>
            let Some(rest) = lease_key.strip_prefix(LEASE_PREFIX) else {
                continue;
            };
            let Some((api_key, _)) = rest.rsplit_once(':') else {
                continue;
            };

            match self.store.release_slot(&counter_key(api_key), &lease_key).await {
                Ok(true) => {
                    reclaimed += 1;
                    info!(
                        key.preview = %key_preview(api_key),
                        "Reclaimed leaked concurrency slot"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(lease = %lease_key, error = %e, "Failed to reclaim lease");
                }
            }
        }

        Ok(reclaimed)
    }

    /// Drop all admission state for a deleted key.
    pub async fn forget(&self, key: &str) -> Result<()> {
        for lease_key in self
            .store
            .keys_with_prefix(&format!("{LEASE_PREFIX}{key}:"))
            .await?
        {
            self.store.delete(&lease_key).await?;
        }
        self.store.delete(&counter_key(key)).await?;
        Ok(())
    }

    /// Spawn the background lease sweep.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_expired().await {
                    warn!(error = %e, "Lease sweep failed");
                }
            }
        })
    }
}
