// src/config/app.rs

use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Key selection policy applied pool-wide.
///
/// This is a runtime configuration value, not a per-call choice; callers get
/// whatever policy the pool is configured with.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Stay on one key per group until it becomes unhealthy.
    Sticky,
    /// Advance a persisted cursor on every pick.
    RoundRobin,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::Sticky
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sticky => write!(f, "sticky"),
            Self::RoundRobin => write!(f, "round_robin"),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sticky" => Ok(Self::Sticky),
            "round_robin" | "roundrobin" | "round-robin" => Ok(Self::RoundRobin),
            other => Err(format!("unknown selection strategy '{other}'")),
        }
    }
}

/// A group of keys seeded from the config file at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct KeyGroup {
    pub name: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Default for KeyGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            api_keys: Vec::new(),
            weight: default_weight(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub admin_token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            admin_token: None,
        }
    }
}

/// Pool-level tuning. Every field has a safe default so a minimal config file
/// (or none at all) yields a working pool.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_protection_seconds")]
    pub protection_seconds: u64,
    #[serde(default = "default_disable_codes")]
    pub disable_codes: Vec<u16>,
    #[serde(default = "default_cooldown_codes")]
    pub cooldown_codes: Vec<u16>,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_lease_sweep_interval")]
    pub lease_sweep_interval_secs: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_cursor_ttl")]
    pub cursor_ttl_secs: u64,
    #[serde(default = "default_audit_retention")]
    pub audit_retention_days: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            protection_seconds: default_protection_seconds(),
            disable_codes: default_disable_codes(),
            cooldown_codes: default_cooldown_codes(),
            strategy: SelectionStrategy::default(),
            max_concurrent: default_max_concurrent(),
            lease_timeout_secs: default_lease_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
            lease_sweep_interval_secs: default_lease_sweep_interval(),
            lock_ttl_secs: default_lock_ttl(),
            lock_retries: default_lock_retries(),
            lock_retry_delay_ms: default_lock_retry_delay(),
            cursor_ttl_secs: default_cursor_ttl(),
            audit_retention_days: default_audit_retention(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub groups: Vec<KeyGroup>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub redis_key_prefix: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Effective coordination-cache key prefix.
    pub fn key_prefix(&self) -> String {
        self.redis_key_prefix
            .clone()
            .unwrap_or_else(|| "keypool:".to_string())
    }

    /// Effective persistent store URL.
    pub fn database_url(&self) -> String {
        self.database_url
            .clone()
            .unwrap_or_else(|| "sqlite:keypool.db".to_string())
    }
}

// Default value functions

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_weight() -> u32 {
    1
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_protection_seconds() -> u64 {
    5
}

fn default_disable_codes() -> Vec<u16> {
    vec![401, 403]
}

fn default_cooldown_codes() -> Vec<u16> {
    vec![429]
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_lease_timeout() -> u64 {
    120
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_lease_sweep_interval() -> u64 {
    10
}

fn default_lock_ttl() -> u64 {
    5
}

fn default_lock_retries() -> u32 {
    3
}

fn default_lock_retry_delay() -> u64 {
    100
}

fn default_cursor_ttl() -> u64 {
    3600
}

fn default_audit_retention() -> u32 {
    30
}
