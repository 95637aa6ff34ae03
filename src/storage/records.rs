// src/storage/records.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Redact key material for logs and listings: first four and last four
/// characters only.
pub fn key_preview(key: &str) -> String {
    if key.len() > 8 {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        key.to_string()
    }
}

/// Health status of a key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Enabled,
    Disabled,
    Cooldown,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Cooldown => "cooldown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(Self::Enabled),
            "disabled" => Some(Self::Disabled),
            "cooldown" => Some(Self::Cooldown),
            _ => None,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log actions. The audit trail is append-only; entries are removed by
/// the retention sweep only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    AddKey,
    UpdateKey,
    DeleteKey,
    GetKey,
    Report,
    CooldownStart,
    CooldownEnd,
    DisableKey,
    EnableKey,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddKey => "AddKey",
            Self::UpdateKey => "UpdateKey",
            Self::DeleteKey => "DeleteKey",
            Self::GetKey => "GetKey",
            Self::Report => "Report",
            Self::CooldownStart => "CooldownStart",
            Self::CooldownEnd => "CooldownEnd",
            Self::DisableKey => "DisableKey",
            Self::EnableKey => "EnableKey",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AddKey" => Some(Self::AddKey),
            "UpdateKey" => Some(Self::UpdateKey),
            "DeleteKey" => Some(Self::DeleteKey),
            "GetKey" => Some(Self::GetKey),
            "Report" => Some(Self::Report),
            "CooldownStart" => Some(Self::CooldownStart),
            "CooldownEnd" => Some(Self::CooldownEnd),
            "DisableKey" => Some(Self::DisableKey),
            "EnableKey" => Some(Self::EnableKey),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key record as stored durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// The opaque secret; unique across the store.
    pub key: String,
    /// Routing group (e.g. a region) the key serves.
    pub group: String,
    /// Operator-facing display name.
    pub name: String,
    pub status: KeyStatus,
    /// Priority weight: 0 means fallback tier, anything above is normal tier.
    pub weight: u32,
    pub usage_count: u64,
    pub error_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyRecord {
    pub fn is_fallback(&self) -> bool {
        self.weight == 0
    }

    pub fn preview(&self) -> String {
        key_preview(&self.key)
    }
}

/// Fields for an explicit add operation.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub key: String,
    pub group: String,
    pub name: String,
    pub weight: u32,
}

impl NewKey {
    pub fn new(key: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            name: String::new(),
            weight: 1,
        }
    }
}

/// Partial update for the edit operation; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub group: Option<String>,
    pub weight: Option<u32>,
}

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub key: String,
    pub action: AuditAction,
    pub code: Option<u16>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}
