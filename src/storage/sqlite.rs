// src/storage/sqlite.rs

//! SQLite-backed key repository using sqlx.
//!
//! Schema: `api_keys` keyed by the secret itself (UNIQUE), plus an
//! append-only `key_audit` table. Timestamps are stored as unix seconds.

use crate::error::{AppError, Result};
use crate::storage::records::{
    key_preview, AuditAction, AuditEntry, KeyRecord, KeyStatus, KeyUpdate, NewKey,
};
use crate::storage::traits::KeyRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;

type KeyRow = (
    String,      // key
    String,      // group_name
    String,      // display_name
    String,      // status
    i64,         // weight
    i64,         // usage_count
    i64,         // error_count
    Option<i64>, // last_used_at
    i64,         // created_at
    i64,         // updated_at
);

const SELECT_COLUMNS: &str = "key, group_name, display_name, status, weight, usage_count, \
     error_count, last_used_at, created_at, updated_at";

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_record(row: KeyRow) -> Result<KeyRecord> {
    let (key, group, name, status, weight, usage, errors, last_used, created, updated) = row;
    let status = KeyStatus::parse(&status).ok_or_else(|| AppError::Database {
        message: format!("Unknown status '{status}' for key {}", key_preview(&key)),
    })?;
    Ok(KeyRecord {
        key,
        group,
        name,
        status,
        weight: weight.max(0) as u32,
        usage_count: usage.max(0) as u64,
        error_count: errors.max(0) as u64,
        last_used_at: last_used.map(ts),
        created_at: ts(created),
        updated_at: ts(updated),
    })
}

/// A persistent [`KeyRepository`] backed by SQLite.
pub struct SqliteKeyRepository {
    pool: SqlitePool,
}

impl SqliteKeyRepository {
    /// Connects to a SQLite database (e.g. `"sqlite:keypool.db"` or
    /// `"sqlite::memory:"`), creating the file and schema if missing.
    pub async fn new(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::Database {
                message: format!("Invalid database URL: {e}"),
            })?
            .create_if_missing(true);
        // an in-memory database exists per connection; a pool of them would
        // see different (empty) databases
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Run schema migrations (idempotent).
    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_keys (
                key           TEXT    PRIMARY KEY,
                group_name    TEXT    NOT NULL,
                display_name  TEXT    NOT NULL DEFAULT '',
                status        TEXT    NOT NULL DEFAULT 'enabled',
                weight        INTEGER NOT NULL DEFAULT 1,
                usage_count   INTEGER NOT NULL DEFAULT 0,
                error_count   INTEGER NOT NULL DEFAULT 0,
                last_used_at  INTEGER,
                created_at    INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at    INTEGER NOT NULL DEFAULT (unixepoch())
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_keys_group_status
             ON api_keys(group_name, status)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS key_audit (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                key         TEXT    NOT NULL,
                action      TEXT    NOT NULL,
                code        INTEGER,
                note        TEXT,
                created_at  INTEGER NOT NULL DEFAULT (unixepoch())
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_key
             ON key_audit(key, created_at)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn fetch_record(&self, key: &str) -> Result<Option<KeyRecord>> {
        let row: Option<KeyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys WHERE key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_record).transpose()
    }
}

#[async_trait]
impl KeyRepository for SqliteKeyRepository {
    async fn add_key(&self, new: NewKey) -> Result<KeyRecord> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM api_keys WHERE key = ?")
                .bind(&new.key)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_some() {
            return Err(AppError::KeyExists {
                key_preview: key_preview(&new.key),
            });
        }

        sqlx::query(
            "INSERT INTO api_keys (key, group_name, display_name, status, weight, created_at, updated_at)
             VALUES (?, ?, ?, 'enabled', ?, ?, ?)",
        )
        .bind(&new.key)
        .bind(&new.group)
        .bind(&new.name)
        .bind(i64::from(new.weight))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO key_audit (key, action, created_at) VALUES (?, ?, ?)")
            .bind(&new.key)
            .bind(AuditAction::AddKey.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.fetch_record(&new.key).await?.ok_or_else(|| AppError::Internal {
            message: "Key vanished immediately after insert".to_string(),
        })
    }

    async fn get_key(&self, key: &str) -> Result<Option<KeyRecord>> {
        self.fetch_record(key).await
    }

    async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        let rows: Vec<KeyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys ORDER BY key ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn enabled_keys_in_group(&self, group: &str) -> Result<Vec<KeyRecord>> {
        let rows: Vec<KeyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys
             WHERE group_name = ? AND status = 'enabled'
             ORDER BY key ASC"
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn keys_with_status(&self, status: KeyStatus) -> Result<Vec<KeyRecord>> {
        let rows: Vec<KeyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys WHERE status = ? ORDER BY key ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn update_key(&self, key: &str, update: KeyUpdate) -> Result<KeyRecord> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE api_keys SET
                 display_name = COALESCE(?, display_name),
                 group_name   = COALESCE(?, group_name),
                 weight       = COALESCE(?, weight),
                 updated_at   = ?
             WHERE key = ?",
        )
        .bind(update.name.as_deref())
        .bind(update.group.as_deref())
        .bind(update.weight.map(i64::from))
        .bind(now)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::KeyNotFound {
                key_preview: key_preview(key),
            });
        }

        sqlx::query("INSERT INTO key_audit (key, action, created_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(AuditAction::UpdateKey.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.fetch_record(key).await?.ok_or_else(|| AppError::KeyNotFound {
            key_preview: key_preview(key),
        })
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM api_keys WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::KeyNotFound {
                key_preview: key_preview(key),
            });
        }

        // The audit trail outlives the record.
        sqlx::query("INSERT INTO key_audit (key, action, created_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(AuditAction::DeleteKey.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_selection(&self, key: &str, note: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE api_keys
             SET usage_count = usage_count + 1, last_used_at = ?, updated_at = ?
             WHERE key = ? AND status = 'enabled'",
        )
        .bind(now)
        .bind(now)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM api_keys WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                None => AppError::KeyNotFound {
                    key_preview: key_preview(key),
                },
                Some(_) => AppError::Internal {
                    message: format!(
                        "Selection of {} raced with a status change",
                        key_preview(key)
                    ),
                },
            });
        }

        sqlx::query("INSERT INTO key_audit (key, action, note, created_at) VALUES (?, ?, ?, ?)")
            .bind(key)
            .bind(AuditAction::GetKey.as_str())
            .bind(note)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
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
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM api_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((current,)) = current else {
            return Err(AppError::KeyNotFound {
                key_preview: key_preview(key),
            });
        };

        if let Some(expected) = from {
            if KeyStatus::parse(&current) != Some(expected) {
                return Ok(None);
            }
        }

        let bump = i64::from(bump_error_count);
        sqlx::query(
            "UPDATE api_keys
             SET status = ?, error_count = error_count + ?, updated_at = ?
             WHERE key = ?",
        )
        .bind(to.as_str())
        .bind(bump)
        .bind(now)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO key_audit (key, action, code, note, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(action.as_str())
        .bind(code.map(i64::from))
        .bind(note)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.fetch_record(key).await
    }

    async fn append_audit(
        &self,
        key: &str,
        action: AuditAction,
        code: Option<u16>,
        note: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO key_audit (key, action, code, note, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(action.as_str())
        .bind(code.map(i64::from))
        .bind(note)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_entries(&self, key: Option<&str>, limit: u32) -> Result<Vec<AuditEntry>> {
        type AuditRow = (i64, String, String, Option<i64>, Option<String>, i64);

        let rows: Vec<AuditRow> = match key {
            Some(key) => {
                sqlx::query_as(
                    "SELECT id, key, action, code, note, created_at FROM key_audit
                     WHERE key = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(key)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, key, action, code, note, created_at FROM key_audit
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|(id, key, action, code, note, created_at)| {
                let action = AuditAction::parse(&action).ok_or_else(|| AppError::Database {
                    message: format!("Unknown audit action '{action}'"),
                })?;
                Ok(AuditEntry {
                    id,
                    key,
                    action,
                    code: code.and_then(|c| u16::try_from(c).ok()),
                    note,
                    created_at: ts(created_at),
                })
            })
            .collect()
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM key_audit WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> SqliteKeyRepository {
        SqliteKeyRepository::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn add_and_fetch_round_trip() {
        let repo = repo().await;
        let record = repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();
        assert_eq!(record.key, "secret1");
        assert_eq!(record.status, KeyStatus::Enabled);
        assert_eq!(record.weight, 1);

        let fetched = repo.get_key("secret1").await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let repo = repo().await;
        repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();
        let err = repo.add_key(NewKey::new("secret1", "westus")).await.unwrap_err();
        assert!(matches!(err, AppError::KeyExists { .. }));
    }

    #[tokio::test]
    async fn conditional_transition_skips_on_mismatch() {
        let repo = repo().await;
        repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();

        let skipped = repo
            .transition_status(
                "secret1",
                Some(KeyStatus::Cooldown),
                KeyStatus::Enabled,
                AuditAction::CooldownEnd,
                None,
                None,
                false,
            )
            .await
            .unwrap();
        assert!(skipped.is_none());

        // no audit entry for the skipped transition
        let audit = repo.audit_entries(Some("secret1"), 10).await.unwrap();
        assert!(audit.iter().all(|e| e.action != AuditAction::CooldownEnd));
    }

    #[tokio::test]
    async fn selection_updates_counters_and_audit() {
        let repo = repo().await;
        repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();
        repo.record_selection("secret1", Some("asr")).await.unwrap();
        repo.record_selection("secret1", None).await.unwrap();

        let record = repo.get_key("secret1").await.unwrap().unwrap();
        assert_eq!(record.usage_count, 2);
        assert!(record.last_used_at.is_some());

        let audit = repo.audit_entries(Some("secret1"), 10).await.unwrap();
        let picks = audit.iter().filter(|e| e.action == AuditAction::GetKey).count();
        assert_eq!(picks, 2);
    }

    #[tokio::test]
    async fn selection_of_disabled_key_fails() {
        let repo = repo().await;
        repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();
        repo.transition_status(
            "secret1",
            None,
            KeyStatus::Disabled,
            AuditAction::DisableKey,
            Some(401),
            None,
            true,
        )
        .await
        .unwrap();

        assert!(repo.record_selection("secret1", None).await.is_err());
    }

    #[tokio::test]
    async fn delete_leaves_audit_trail() {
        let repo = repo().await;
        repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();
        repo.delete_key("secret1").await.unwrap();

        assert!(repo.get_key("secret1").await.unwrap().is_none());
        let audit = repo.audit_entries(Some("secret1"), 10).await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::DeleteKey));
    }

    #[tokio::test]
    async fn purge_removes_old_entries_only() {
        let repo = repo().await;
        repo.add_key(NewKey::new("secret1", "eastus")).await.unwrap();

        let removed = repo
            .purge_audit_before(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = repo
            .purge_audit_before(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(removed >= 1);
    }
}
