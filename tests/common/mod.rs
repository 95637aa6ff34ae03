//! Common test utilities and fixtures

use keypool::config::{AppConfig, KeyGroup};
use keypool::coordination::{CoordinationStore, InMemoryCoordinationStore};
use keypool::state::AppState;
use keypool::storage::{InMemoryKeyRepository, KeyRepository};
use std::sync::Arc;

/// Builder for a fully wired in-memory pool.
pub struct TestPoolBuilder {
    config: AppConfig,
}

impl TestPoolBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_cooldown_seconds(mut self, secs: u64) -> Self {
        self.config.pool.cooldown_seconds = secs;
        self
    }

    pub fn with_strategy(mut self, strategy: keypool::config::SelectionStrategy) -> Self {
        self.config.pool.strategy = strategy;
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.config.server.admin_token = Some(secrecy::Secret::new(token.into()));
        self
    }

    /// Seed a group with weight-1 keys.
    pub fn with_group(mut self, name: impl Into<String>, keys: &[&str]) -> Self {
        self.config.groups.push(KeyGroup {
            name: name.into(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            weight: 1,
        });
        self
    }

    pub async fn build(self) -> TestPool {
        let coord: Arc<InMemoryCoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        let repo: Arc<InMemoryKeyRepository> = Arc::new(InMemoryKeyRepository::new());
        let state = AppState::with_stores(
            self.config,
            coord.clone() as Arc<dyn CoordinationStore>,
            repo.clone() as Arc<dyn KeyRepository>,
        )
        .await
        .expect("test pool wiring failed");

        TestPool {
            coord,
            repo,
            state: Arc::new(state),
        }
    }
}

impl Default for TestPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestPool {
    pub coord: Arc<InMemoryCoordinationStore>,
    pub repo: Arc<InMemoryKeyRepository>,
    pub state: Arc<AppState>,
}
