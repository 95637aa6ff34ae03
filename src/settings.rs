// src/settings.rs

//! Runtime settings with read-through semantics.
//!
//! Operators can retune the pool without a restart by writing `settings:*`
//! entries into the coordination store; anything absent (or unreadable) falls
//! back to the file-config defaults. These values steer behavior but are not
//! correctness-critical, so cache failures degrade to defaults with a warning
//! instead of failing the operation.

use crate::config::{PoolConfig, SelectionStrategy};
use crate::coordination::CoordinationStore;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

const COOLDOWN_SECONDS: &str = "settings:cooldown_seconds";
const DISABLE_CODES: &str = "settings:disable_codes";
const COOLDOWN_CODES: &str = "settings:cooldown_codes";
const STRATEGY: &str = "settings:strategy";
const MAX_CONCURRENT: &str = "settings:max_concurrent";

pub struct RuntimeSettings {
    store: Arc<dyn CoordinationStore>,
    defaults: PoolConfig,
}

impl RuntimeSettings {
    pub fn new(store: Arc<dyn CoordinationStore>, defaults: PoolConfig) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &PoolConfig {
        &self.defaults
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(setting = key, error = %e, "Failed to read runtime setting, using default");
                None
            }
        }
    }

    pub async fn cooldown_seconds(&self) -> u64 {
        self.read(COOLDOWN_SECONDS)
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.defaults.cooldown_seconds)
    }

    pub async fn disable_codes(&self) -> HashSet<u16> {
        self.code_set(DISABLE_CODES, &self.defaults.disable_codes).await
    }

    pub async fn cooldown_codes(&self) -> HashSet<u16> {
        self.code_set(COOLDOWN_CODES, &self.defaults.cooldown_codes).await
    }

    pub async fn selection_strategy(&self) -> SelectionStrategy {
        self.read(STRATEGY)
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.defaults.strategy)
    }

    pub async fn max_concurrent(&self) -> u32 {
        self.read(MAX_CONCURRENT)
            .await
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(self.defaults.max_concurrent)
    }

    /// Code sets are stored as comma-separated lists, e.g. `"401,403"`.
    async fn code_set(&self, key: &str, default: &[u16]) -> HashSet<u16> {
        match self.read(key).await {
            Some(raw) => {
                let parsed: HashSet<u16> = raw
                    .split(',')
                    .filter_map(|part| part.trim().parse().ok())
                    .collect();
                if parsed.is_empty() {
                    default.iter().copied().collect()
                } else {
                    parsed
                }
            }
            None => default.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;

    fn settings(store: Arc<InMemoryCoordinationStore>) -> RuntimeSettings {
        RuntimeSettings::new(store, PoolConfig::default())
    }

    #[tokio::test]
    async fn absent_settings_fall_back_to_defaults() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let settings = settings(store);

        assert_eq!(settings.cooldown_seconds().await, 300);
        assert_eq!(settings.selection_strategy().await, SelectionStrategy::Sticky);
        assert!(settings.disable_codes().await.contains(&401));
        assert!(settings.cooldown_codes().await.contains(&429));
        assert_eq!(settings.max_concurrent().await, 10);
    }

    #[tokio::test]
    async fn store_values_override_defaults() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store.set("settings:cooldown_seconds", "60", None).await.unwrap();
        store.set("settings:strategy", "round_robin", None).await.unwrap();
        store.set("settings:disable_codes", "401, 403, 498", None).await.unwrap();
        let settings = settings(store);

        assert_eq!(settings.cooldown_seconds().await, 60);
        assert_eq!(
            settings.selection_strategy().await,
            SelectionStrategy::RoundRobin
        );
        assert!(settings.disable_codes().await.contains(&498));
    }

    #[tokio::test]
    async fn garbage_values_fall_back() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store.set("settings:cooldown_seconds", "soon", None).await.unwrap();
        store.set("settings:max_concurrent", "0", None).await.unwrap();
        let settings = settings(store);

        assert_eq!(settings.cooldown_seconds().await, 300);
        assert_eq!(settings.max_concurrent().await, 10);
    }
}
