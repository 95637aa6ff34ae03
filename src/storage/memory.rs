// src/storage/memory.rs

use crate::error::{AppError, Result};
use crate::storage::records::{
    key_preview, AuditAction, AuditEntry, KeyRecord, KeyStatus, KeyUpdate, NewKey,
};
use crate::storage::traits::KeyRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    keys: HashMap<String, KeyRecord>,
    audit: Vec<AuditEntry>,
    next_audit_id: i64,
}

impl Inner {
    fn push_audit(
        &mut self,
        key: &str,
        action: AuditAction,
        code: Option<u16>,
        note: Option<&str>,
    ) {
        self.next_audit_id += 1;
        self.audit.push(AuditEntry {
            id: self.next_audit_id,
            key: key.to_string(),
            action,
            code,
            note: note.map(str::to_string),
            created_at: Utc::now(),
        });
    }
}

/// In-memory implementation of the key repository.
///
/// One mutex over the whole state gives each operation the same all-or-nothing
/// behavior the SQLite implementation gets from transactions.
#[derive(Default)]
pub struct InMemoryKeyRepository {
    inner: Mutex<Inner>,
}

impl InMemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRepository for InMemoryKeyRepository {
    async fn add_key(&self, new: NewKey) -> Result<KeyRecord> {
        let mut inner = self.inner.lock();
        if inner.keys.contains_key(&new.key) {
            return Err(AppError::KeyExists {
                key_preview: key_preview(&new.key),
            });
        }

        let now = Utc::now();
        let record = KeyRecord {
            key: new.key.clone(),
            group: new.group,
            name: new.name,
            status: KeyStatus::Enabled,
            weight: new.weight,
            usage_count: 0,
            error_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.keys.insert(new.key.clone(), record.clone());
        inner.push_audit(&new.key, AuditAction::AddKey, None, None);
        Ok(record)
    }

    async fn get_key(&self, key: &str) -> Result<Option<KeyRecord>> {
        Ok(self.inner.lock().keys.get(key).cloned())
    }

    async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<KeyRecord> = inner.keys.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn enabled_keys_in_group(&self, group: &str) -> Result<Vec<KeyRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<KeyRecord> = inner
            .keys
            .values()
            .filter(|r| r.group == group && r.status == KeyStatus::Enabled)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn keys_with_status(&self, status: KeyStatus) -> Result<Vec<KeyRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<KeyRecord> = inner
            .keys
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn update_key(&self, key: &str, update: KeyUpdate) -> Result<KeyRecord> {
        let mut inner = self.inner.lock();
        let record = inner.keys.get_mut(key).ok_or_else(|| AppError::KeyNotFound {
            key_preview: key_preview(key),
        })?;

        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(group) = update.group {
            record.group = group;
        }
        if let Some(weight) = update.weight {
            record.weight = weight;
        }
        record.updated_at = Utc::now();
        let updated = record.clone();

        inner.push_audit(key, AuditAction::UpdateKey, None, None);
        Ok(updated)
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.keys.remove(key).is_none() {
            return Err(AppError::KeyNotFound {
                key_preview: key_preview(key),
            });
        }
        inner.push_audit(key, AuditAction::DeleteKey, None, None);
        Ok(())
    }

    async fn record_selection(&self, key: &str, note: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.keys.get_mut(key).ok_or_else(|| AppError::KeyNotFound {
            key_preview: key_preview(key),
        })?;
        if record.status != KeyStatus::Enabled {
            return Err(AppError::Internal {
                message: format!(
                    "Selection of {} raced with a status change",
                    key_preview(key)
                ),
            });
        }

        record.usage_count += 1;
        record.last_used_at = Some(Utc::now());
        record.updated_at = Utc::now();

        inner.push_audit(key, AuditAction::GetKey, None, note);
        Ok(())
    }

    async fn transition_status(
        &self,
        key: &str,
        from: Option<KeyStatus>,
        to: KeyStatus,
        action: AuditAction,
        code: Option<u16>,
        note: Option<&str>,
        bump_error_count: bool,
    ) -> Result<Option<KeyRecord>> {
        let mut inner = self.inner.lock();
        let record = inner.keys.get_mut(key).ok_or_else(|| AppError::KeyNotFound {
            key_preview: key_preview(key),
        })?;

        if let Some(expected) = from {
            if record.status != expected {
                return Ok(None);
            }
        }

        record.status = to;
        if bump_error_count {
            record.error_count += 1;
        }
        record.updated_at = Utc::now();
        let updated = record.clone();

        inner.push_audit(key, action, code, note);
        Ok(Some(updated))
    }

    async fn append_audit(
        &self,
        key: &str,
        action: AuditAction,
        code: Option<u16>,
        note: Option<&str>,
    ) -> Result<()> {
        self.inner.lock().push_audit(key, action, code, note);
        Ok(())
    }

    async fn audit_entries(&self, key: Option<&str>, limit: u32) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.lock();
        let mut entries: Vec<AuditEntry> = inner
            .audit
            .iter()
            .filter(|e| key.map_or(true, |k| e.key == k))
            .cloned()
            .collect();
        entries.reverse();
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.audit.len();
        inner.audit.retain(|e| e.created_at >= cutoff);
        Ok((before - inner.audit.len()) as u64)
    }
}
