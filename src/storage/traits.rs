// src/storage/traits.rs

use crate::error::Result;
use crate::storage::records::{AuditAction, AuditEntry, KeyRecord, KeyStatus, KeyUpdate, NewKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable key store operations.
///
/// Every mutating method runs as a single transaction: the status write, the
/// counter change and the audit entry either all land or none do.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Insert a new key (status Enabled) and its `AddKey` audit entry.
    /// Fails with `KeyExists` when the identity is already present.
    async fn add_key(&self, new: NewKey) -> Result<KeyRecord>;

    async fn get_key(&self, key: &str) -> Result<Option<KeyRecord>>;

    /// All records, ordered by key identity.
    async fn list_keys(&self) -> Result<Vec<KeyRecord>>;

    /// Enabled records in one routing group, ordered by key identity.
    async fn enabled_keys_in_group(&self, group: &str) -> Result<Vec<KeyRecord>>;

    /// All records currently carrying the given status.
    async fn keys_with_status(&self, status: KeyStatus) -> Result<Vec<KeyRecord>>;

    /// Apply a partial edit and append an `UpdateKey` audit entry.
    async fn update_key(&self, key: &str, update: KeyUpdate) -> Result<KeyRecord>;

    /// Remove the record, leaving a `DeleteKey` audit entry behind.
    async fn delete_key(&self, key: &str) -> Result<()>;

    /// Mark a successful selection: usage counter +1, last-used timestamp and
    /// a `GetKey` audit entry, all in one transaction whose update re-checks
    /// the record is still Enabled.
    async fn record_selection(&self, key: &str, note: Option<&str>) -> Result<()>;

    /// Transition the health status.
    ///
    /// When `from` is `Some`, the transition only happens while the current
    /// status matches (conditional transition; returns `Ok(None)` otherwise).
    /// On success the status write, the optional error-counter bump and the
    /// audit entry commit together, and the updated record is returned.
    #[allow(clippy::too_many_arguments)]
    async fn transition_status(
        &self,
        key: &str,
        from: Option<KeyStatus>,
        to: KeyStatus,
        action: AuditAction,
        code: Option<u16>,
        note: Option<&str>,
        bump_error_count: bool,
    ) -> Result<Option<KeyRecord>>;

    /// Append a standalone audit entry (log-only outcomes).
    async fn append_audit(
        &self,
        key: &str,
        action: AuditAction,
        code: Option<u16>,
        note: Option<&str>,
    ) -> Result<()>;

    /// Most recent audit entries, optionally filtered to one key.
    async fn audit_entries(&self, key: Option<&str>, limit: u32) -> Result<Vec<AuditEntry>>;

    /// Retention sweep: drop audit entries older than `cutoff`. Returns the
    /// number removed.
    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
