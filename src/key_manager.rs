// src/key_manager.rs

//! Key selection engine and health state machine.
//!
//! All cross-process invariants run through the lock service: selections for
//! one routing group hold `getkey:<group>`, status transitions for one key
//! hold `setstatus:<key>`. A selection and a status update for the same key
//! may interleave; the suspension check during selection is the
//! synchronization point.

use crate::admission::ConcurrencyLimiter;
use crate::config::SelectionStrategy;
use crate::cooldown::CooldownManager;
use crate::error::{AppError, Result};
use crate::events::HealthEventBus;
use crate::lock::LockService;
use crate::settings::RuntimeSettings;
use crate::storage::{
    key_preview, AuditAction, AuditEntry, KeyRecord, KeyRepository, KeyStatus, KeyUpdate, NewKey,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Priority tier partition. The normal tier is tried in full before any
/// fallback candidate is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Normal,
    Fallback,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fallback => "fallback",
        }
    }

    fn contains(self, record: &KeyRecord) -> bool {
        match self {
            Self::Normal => !record.is_fallback(),
            Self::Fallback => record.is_fallback(),
        }
    }
}

/// What a reported outcome did to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeAction {
    Disable,
    Cooldown,
    Skip,
    NoChange,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OutcomeReport {
    pub status_changed: bool,
    pub action: OutcomeAction,
}

impl OutcomeReport {
    fn skip() -> Self {
        Self {
            status_changed: false,
            action: OutcomeAction::Skip,
        }
    }
}

pub struct KeyManager {
    repo: Arc<dyn KeyRepository>,
    cooldown: Arc<CooldownManager>,
    limiter: ConcurrencyLimiter,
    locks: LockService,
    settings: Arc<RuntimeSettings>,
    events: Arc<HealthEventBus>,
    lock_ttl: Duration,
    lock_retries: u32,
    cursor_ttl: Duration,
}

impl KeyManager {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        cooldown: Arc<CooldownManager>,
        limiter: ConcurrencyLimiter,
        locks: LockService,
        settings: Arc<RuntimeSettings>,
        events: Arc<HealthEventBus>,
    ) -> Self {
        let pool = settings.defaults();
        let lock_ttl = Duration::from_secs(pool.lock_ttl_secs);
        let lock_retries = pool.lock_retries;
        let cursor_ttl = Duration::from_secs(pool.cursor_ttl_secs);
        Self {
            repo,
            cooldown,
            limiter,
            locks,
            settings,
            events,
            lock_ttl,
            lock_retries,
            cursor_ttl,
        }
    }

    /// Upsert keys declared in the config file. Existing records win; seeding
    /// never overwrites operator edits.
    pub async fn seed_from_config(&self, groups: &[crate::config::KeyGroup]) -> Result<()> {
        for group in groups {
            for api_key in &group.api_keys {
                if self.repo.get_key(api_key).await?.is_none() {
                    let new = NewKey {
                        key: api_key.clone(),
                        group: group.name.clone(),
                        name: String::new(),
                        weight: group.weight,
                    };
                    let record = self.repo.add_key(new).await?;
                    info!(
                        key.preview = %record.preview(),
                        group = %record.group,
                        "Seeded key from config"
                    );
                }
            }
        }
        Ok(())
    }

    /// Pick a healthy key for `group`.
    ///
    /// The strategy comes from runtime configuration; the override parameter
    /// exists for administrative and diagnostic calls only. Fails with
    /// `NoAvailableKey` when every eligible key in both tiers is suspended,
    /// and fails closed when the coordination cache cannot answer suspension
    /// checks.
    #[instrument(level = "debug", skip(self, tag, strategy_override), fields(group = group))]
    pub async fn get_key(
        &self,
        group: &str,
        tag: Option<&str>,
        strategy_override: Option<SelectionStrategy>,
    ) -> Result<KeyRecord> {
        let strategy = match strategy_override {
            Some(strategy) => strategy,
            None => self.settings.selection_strategy().await,
        };

        let lock_name = format!("getkey:{group}");
        self.locks
            .with_lock(&lock_name, self.lock_ttl, self.lock_retries, || async {
                self.select_locked(group, tag, strategy).await
            })
            .await
    }

    async fn select_locked(
        &self,
        group: &str,
        tag: Option<&str>,
        strategy: SelectionStrategy,
    ) -> Result<KeyRecord> {
        let candidates = self.repo.enabled_keys_in_group(group).await?;

        for tier in [Tier::Normal, Tier::Fallback] {
            let mut available = Vec::new();
            for record in candidates.iter().filter(|r| tier.contains(r)) {
                // fail closed: a key we cannot verify is never routed to
                if !self.cooldown.is_suspended(&record.key).await? {
                    available.push(record.clone());
                }
            }
            if available.is_empty() {
                continue;
            }

            let chosen = match strategy {
                SelectionStrategy::Sticky => self.pick_sticky(group, &available).await?,
                SelectionStrategy::RoundRobin => {
                    self.pick_round_robin(group, tier, &available).await
                }
            };

            self.repo.record_selection(&chosen.key, tag).await?;
            if strategy == SelectionStrategy::Sticky {
                self.cooldown.set_active_key(group, &chosen.key).await?;
            }

            debug!(
                key.preview = %chosen.preview(),
                tier = tier.as_str(),
                strategy = %strategy,
                "Selected key"
            );
            return Ok(chosen);
        }

        warn!(group, "Every eligible key is suspended");
        Err(AppError::NoAvailableKey {
            group: group.to_string(),
        })
    }

    /// Sticky pick over the identity-sorted availability list:
    /// continuity first, then forward progress, then wrap-around, then
    /// last-resort reuse of the marker key itself.
    async fn pick_sticky(&self, group: &str, available: &[KeyRecord]) -> Result<KeyRecord> {
        let marker = self.cooldown.active_key(group).await?;

        if let Some(active) = &marker {
            if let Some(record) = available.iter().find(|r| &r.key == active) {
                return Ok(record.clone());
            }
        }

        let prev = marker.unwrap_or_default();

        // continue the rotation direction past the previous active key
        if let Some(record) = available.iter().find(|r| r.key.as_str() > prev.as_str()) {
            return Ok(record.clone());
        }
        // wrap to the smallest candidate, excluding the key that just dropped out
        if let Some(record) = available.iter().find(|r| r.key != prev) {
            return Ok(record.clone());
        }
        // last resort: the previously-active key recovered and is the only option
        if let Some(record) = available.iter().find(|r| r.key == prev) {
            return Ok(record.clone());
        }

        Ok(available[0].clone())
    }

    async fn pick_round_robin(
        &self,
        group: &str,
        tier: Tier,
        available: &[KeyRecord],
    ) -> KeyRecord {
        let index = self
            .cooldown
            .advance_cursor(group, tier.as_str(), available.len(), self.cursor_ttl)
            .await;
        available[index].clone()
    }

    /// Apply a reported response-outcome code to a key.
    ///
    /// Runs under the per-key status lock; the status write, the error
    /// counter and the audit entry commit in one persistent transaction, and
    /// the cooldown-cache write happens only after that commit.
    #[instrument(level = "debug", skip_all, fields(key.preview = %key_preview(key), code = code))]
    pub async fn report_outcome(
        &self,
        key: &str,
        code: u16,
        note: Option<&str>,
    ) -> Result<OutcomeReport> {
        let lock_name = format!("setstatus:{key}");
        self.locks
            .with_lock(&lock_name, self.lock_ttl, self.lock_retries, || async {
                let record =
                    self.repo
                        .get_key(key)
                        .await?
                        .ok_or_else(|| AppError::KeyNotFound {
                            key_preview: key_preview(key),
                        })?;

                if self.settings.disable_codes().await.contains(&code) {
                    return self.apply_disable(&record, code, note).await;
                }
                if self.settings.cooldown_codes().await.contains(&code) {
                    return self.apply_cooldown(&record, code, note).await;
                }

                self.repo
                    .append_audit(key, AuditAction::Report, Some(code), note)
                    .await?;
                Ok(OutcomeReport {
                    status_changed: false,
                    action: OutcomeAction::NoChange,
                })
            })
            .await
    }

    async fn apply_disable(
        &self,
        record: &KeyRecord,
        code: u16,
        note: Option<&str>,
    ) -> Result<OutcomeReport> {
        if record.status == KeyStatus::Disabled {
            debug!(key.preview = %record.preview(), "Already disabled, skipping");
            return Ok(OutcomeReport::skip());
        }

        let from = record.status;
        let updated = self
            .repo
            .transition_status(
                &record.key,
                Some(from),
                KeyStatus::Disabled,
                AuditAction::DisableKey,
                Some(code),
                note,
                true,
            )
            .await?;
        if updated.is_none() {
            return Ok(OutcomeReport::skip());
        }

        self.cooldown
            .clear_active_key(&record.group, &record.key)
            .await?;
        self.events.emit(&record.key, from, KeyStatus::Disabled);

        warn!(
            key.preview = %record.preview(),
            group = %record.group,
            code,
            "Key disabled"
        );
        Ok(OutcomeReport {
            status_changed: true,
            action: OutcomeAction::Disable,
        })
    }

    async fn apply_cooldown(
        &self,
        record: &KeyRecord,
        code: u16,
        note: Option<&str>,
    ) -> Result<OutcomeReport> {
        match record.status {
            KeyStatus::Cooldown => {
                // never reset a running timer
                debug!(key.preview = %record.preview(), "Already cooling down, skipping");
                Ok(OutcomeReport::skip())
            }
            KeyStatus::Disabled => Ok(OutcomeReport::skip()),
            KeyStatus::Enabled => {
                if self.cooldown.in_protection(&record.key).await? {
                    info!(
                        key.preview = %record.preview(),
                        code,
                        "Cooldown trigger suppressed by protection period"
                    );
                    return Ok(OutcomeReport::skip());
                }

                let seconds = self.settings.cooldown_seconds().await;
                let updated = self
                    .repo
                    .transition_status(
                        &record.key,
                        Some(KeyStatus::Enabled),
                        KeyStatus::Cooldown,
                        AuditAction::CooldownStart,
                        Some(code),
                        note,
                        true,
                    )
                    .await?;
                if updated.is_none() {
                    return Ok(OutcomeReport::skip());
                }

                // cache is secondary to the durable record
                self.cooldown.suspend(&record.key, seconds).await?;
                self.cooldown
                    .clear_active_key(&record.group, &record.key)
                    .await?;
                self.events
                    .emit(&record.key, KeyStatus::Enabled, KeyStatus::Cooldown);

                warn!(
                    key.preview = %record.preview(),
                    group = %record.group,
                    cooldown_secs = seconds,
                    code,
                    "Key entered cooldown"
                );
                Ok(OutcomeReport {
                    status_changed: true,
                    action: OutcomeAction::Cooldown,
                })
            }
        }
    }

    /// Administrative add. Not concurrency-critical; the store's uniqueness
    /// constraint is the arbiter.
    pub async fn add_key(&self, new: NewKey) -> Result<KeyRecord> {
        if new.key.trim().is_empty() {
            return Err(AppError::validation("key", "must not be empty"));
        }
        if new.group.trim().is_empty() {
            return Err(AppError::validation("group", "must not be empty"));
        }
        let record = self.repo.add_key(new).await?;
        info!(key.preview = %record.preview(), group = %record.group, "Key added");
        Ok(record)
    }

    pub async fn update_key(&self, key: &str, update: KeyUpdate) -> Result<KeyRecord> {
        let lock_name = format!("setstatus:{key}");
        self.locks
            .with_lock(&lock_name, self.lock_ttl, self.lock_retries, || async {
                self.repo.update_key(key, update.clone()).await
            })
            .await
    }

    /// Delete a key and every piece of coordination state referencing it.
    pub async fn delete_key(&self, key: &str) -> Result<()> {
        let lock_name = format!("setstatus:{key}");
        self.locks
            .with_lock(&lock_name, self.lock_ttl, self.lock_retries, || async {
                let record =
                    self.repo
                        .get_key(key)
                        .await?
                        .ok_or_else(|| AppError::KeyNotFound {
                            key_preview: key_preview(key),
                        })?;

                self.repo.delete_key(key).await?;
                self.cooldown.forget(key, &record.group).await?;
                self.limiter.forget(key).await?;

                info!(key.preview = %record.preview(), "Key deleted");
                Ok(())
            })
            .await
    }

    /// Manual enable: always ends at Enabled and clears the cooldown-cache
    /// entry (the flag the automatic resume paths leave off).
    pub async fn enable_key(&self, key: &str, note: Option<&str>) -> Result<KeyRecord> {
        let lock_name = format!("setstatus:{key}");
        self.locks
            .with_lock(&lock_name, self.lock_ttl, self.lock_retries, || async {
                let record =
                    self.repo
                        .get_key(key)
                        .await?
                        .ok_or_else(|| AppError::KeyNotFound {
                            key_preview: key_preview(key),
                        })?;
                let from = record.status;

                let updated = self
                    .repo
                    .transition_status(
                        key,
                        None,
                        KeyStatus::Enabled,
                        AuditAction::EnableKey,
                        None,
                        note,
                        false,
                    )
                    .await?
                    .ok_or_else(|| AppError::internal("unconditional transition skipped"))?;

                self.cooldown.resume(key).await?;
                if from != KeyStatus::Enabled {
                    self.events.emit(key, from, KeyStatus::Enabled);
                }

                info!(key.preview = %updated.preview(), "Key enabled");
                Ok(updated)
            })
            .await
    }

    /// Manual disable; terminal until a manual enable.
    pub async fn disable_key(&self, key: &str, note: Option<&str>) -> Result<KeyRecord> {
        let lock_name = format!("setstatus:{key}");
        self.locks
            .with_lock(&lock_name, self.lock_ttl, self.lock_retries, || async {
                let record =
                    self.repo
                        .get_key(key)
                        .await?
                        .ok_or_else(|| AppError::KeyNotFound {
                            key_preview: key_preview(key),
                        })?;

                if record.status == KeyStatus::Disabled {
                    return Ok(record);
                }
                let from = record.status;

                let updated = self
                    .repo
                    .transition_status(
                        key,
                        Some(from),
                        KeyStatus::Disabled,
                        AuditAction::DisableKey,
                        None,
                        note,
                        false,
                    )
                    .await?
                    .ok_or_else(|| AppError::internal("disable raced with another transition"))?;

                self.cooldown.clear_active_key(&record.group, key).await?;
                self.events.emit(key, from, KeyStatus::Disabled);

                info!(key.preview = %updated.preview(), "Key disabled");
                Ok(updated)
            })
            .await
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        self.repo.list_keys().await
    }

    pub async fn get_record(&self, key: &str) -> Result<Option<KeyRecord>> {
        self.repo.get_key(key).await
    }

    pub async fn audit_entries(&self, key: Option<&str>, limit: u32) -> Result<Vec<AuditEntry>> {
        self.repo.audit_entries(key, limit).await
    }
}
