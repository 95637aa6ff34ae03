// src/coordination/memory.rs

use crate::coordination::CoordinationStore;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory implementation of the coordination store.
///
/// A single mutex over the whole map makes every trait operation atomic, which
/// mirrors the single-threaded script execution the Redis implementation gets
/// from the server.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_value(&mut entries, key, now) {
            Some(value) if value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn acquire_slot(
        &self,
        counter_key: &str,
        lease_key: &str,
        max: u32,
        counter_ttl: Duration,
        deadline: i64,
        lease_ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let count: u32 = Self::live_value(&mut entries, counter_key, now)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if count >= max {
            return Ok(false);
        }

        entries.insert(
            counter_key.to_string(),
            Entry {
                value: (count + 1).to_string(),
                expires_at: Some(now + counter_ttl),
            },
        );
        entries.insert(
            lease_key.to_string(),
            Entry {
                value: deadline.to_string(),
                expires_at: Some(now + lease_ttl),
            },
        );
        Ok(true)
    }

    async fn release_slot(&self, counter_key: &str, lease_key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let existed = match entries.remove(lease_key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        };
        if !existed {
            return Ok(false);
        }

        if let Some(count) = Self::live_value(&mut entries, counter_key, now) {
            let count: u32 = count.parse().unwrap_or(0);
            let next = count.saturating_sub(1);
            if let Some(entry) = entries.get_mut(counter_key) {
                entry.value = next.to_string();
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_if_absent_respects_existing_value() {
        let store = InMemoryCoordinationStore::new();
        assert!(store
            .set_if_absent("lock:a", "t1", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock:a", "t2", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn set_if_absent_succeeds_after_expiry() {
        let store = InMemoryCoordinationStore::new();
        store
            .set_if_absent("lock:a", "t1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .set_if_absent("lock:a", "t2", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_only_matches_holder() {
        let store = InMemoryCoordinationStore::new();
        store.set("lock:a", "t1", None).await.unwrap();
        assert!(!store.delete_if_equals("lock:a", "t2").await.unwrap());
        assert!(store.delete_if_equals("lock:a", "t1").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slot_acquire_honors_ceiling_and_release() {
        let store = InMemoryCoordinationStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store
            .acquire_slot("count:k", "lease:k:1", 2, ttl, 0, ttl)
            .await
            .unwrap());
        assert!(store
            .acquire_slot("count:k", "lease:k:2", 2, ttl, 0, ttl)
            .await
            .unwrap());
        assert!(!store
            .acquire_slot("count:k", "lease:k:3", 2, ttl, 0, ttl)
            .await
            .unwrap());

        assert!(store.release_slot("count:k", "lease:k:1").await.unwrap());
        // releasing the same lease twice must not double-decrement
        assert!(!store.release_slot("count:k", "lease:k:1").await.unwrap());
        assert!(store
            .acquire_slot("count:k", "lease:k:3", 2, ttl, 0, ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn keys_with_prefix_skips_expired() {
        let store = InMemoryCoordinationStore::new();
        store
            .set("cooldown:a", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set("cooldown:b", "1", None).await.unwrap();
        store.set("other:c", "1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let keys = store.keys_with_prefix("cooldown:").await.unwrap();
        assert_eq!(keys, vec!["cooldown:b".to_string()]);
    }
}
