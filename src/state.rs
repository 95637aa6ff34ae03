// src/state.rs

use crate::admission::ConcurrencyLimiter;
use crate::config::AppConfig;
use crate::cooldown::CooldownManager;
use crate::coordination::CoordinationStore;
use crate::error::Result;
use crate::events::HealthEventBus;
use crate::key_manager::KeyManager;
use crate::lock::LockService;
use crate::settings::RuntimeSettings;
use crate::storage::{KeyRepository, SqliteKeyRepository};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared application state wired once at startup and handed to every
/// handler and background task.
pub struct AppState {
    pub config: AppConfig,
    pub key_manager: Arc<KeyManager>,
    pub cooldown: Arc<CooldownManager>,
    pub limiter: ConcurrencyLimiter,
    pub settings: Arc<RuntimeSettings>,
    pub events: Arc<HealthEventBus>,
    pub repo: Arc<dyn KeyRepository>,
}

impl AppState {
    /// Build the full stack from configuration: coordination store (Redis
    /// when configured, in-memory otherwise), SQLite repository, and the
    /// pool components on top.
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let coord = build_coordination_store(config)?;
        let repo: Arc<dyn KeyRepository> =
            Arc::new(SqliteKeyRepository::new(&config.database_url()).await?);
        Self::with_stores(config.clone(), coord, repo).await
    }

    /// Wire components onto externally-provided stores. Tests use this with
    /// the in-memory pair.
    pub async fn with_stores(
        config: AppConfig,
        coord: Arc<dyn CoordinationStore>,
        repo: Arc<dyn KeyRepository>,
    ) -> Result<Self> {
        let pool = &config.pool;
        let events = Arc::new(HealthEventBus::new());
        let cooldown = Arc::new(CooldownManager::new(
            coord.clone(),
            repo.clone(),
            events.clone(),
            Duration::from_secs(pool.protection_seconds),
        ));
        let limiter = ConcurrencyLimiter::new(coord.clone());
        let locks = LockService::new(coord.clone(), Duration::from_millis(pool.lock_retry_delay_ms));
        let settings = Arc::new(RuntimeSettings::new(coord, pool.clone()));
        let key_manager = Arc::new(KeyManager::new(
            repo.clone(),
            cooldown.clone(),
            limiter.clone(),
            locks,
            settings.clone(),
            events.clone(),
        ));

        key_manager.seed_from_config(&config.groups).await?;

        Ok(Self {
            config,
            key_manager,
            cooldown,
            limiter,
            settings,
            events,
            repo,
        })
    }

    /// Spawn the reconcile sweep, the lease sweep and (when retention is
    /// enabled) the audit purge loop.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let pool = &self.config.pool;
        let mut tasks = vec![
            self.cooldown
                .clone()
                .spawn_sweep(Duration::from_secs(pool.reconcile_interval_secs)),
            self.limiter
                .clone()
                .spawn_sweep(Duration::from_secs(pool.lease_sweep_interval_secs)),
        ];

        if pool.audit_retention_days > 0 {
            let repo = self.repo.clone();
            let retention_days = i64::from(pool.audit_retention_days);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3600));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                    match repo.purge_audit_before(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "Purged aged audit entries"),
                        Err(e) => warn!(error = %e, "Audit retention purge failed"),
                    }
                }
            }));
        }

        info!(tasks = tasks.len(), "Background tasks started");
        tasks
    }
}

#[cfg(feature = "redis")]
fn build_coordination_store(config: &AppConfig) -> Result<Arc<dyn CoordinationStore>> {
    use crate::coordination::{InMemoryCoordinationStore, RedisCoordinationStore};

    match &config.redis_url {
        Some(url) => {
            let pool = deadpool_redis::Config::from_url(url)
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
            info!("Coordination store: Redis");
            Ok(Arc::new(RedisCoordinationStore::new(
                pool,
                config.key_prefix(),
            )))
        }
        None => {
            warn!("No Redis URL configured; coordination state is process-local");
            Ok(Arc::new(InMemoryCoordinationStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
fn build_coordination_store(config: &AppConfig) -> Result<Arc<dyn CoordinationStore>> {
    use crate::coordination::InMemoryCoordinationStore;

    if config.redis_url.is_some() {
        warn!("Built without the 'redis' feature; ignoring redis_url");
    }
    Ok(Arc::new(InMemoryCoordinationStore::new()))
}
