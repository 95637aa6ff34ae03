// src/coordination/mod.rs

//! Coordination cache abstraction.
//!
//! Everything that needs cross-process agreement (locks, cooldown entries,
//! sticky markers, rotation cursors, admission counters) goes through this
//! trait. Implementations back it with any expiring key/value store; the
//! in-memory variant exists for tests and single-process deployments.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::InMemoryCoordinationStore;
#[cfg(feature = "redis")]
pub use redis::RedisCoordinationStore;

/// Expiring key/value store with the atomic primitives the pool needs.
///
/// `set_if_absent`, `delete_if_equals`, `acquire_slot` and `release_slot` must
/// be atomic with respect to all other operations on the same store; they are
/// the primitives the lock service and admission controller are built on.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, optionally bounded by a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomic "set if absent, with expiry". Returns true when the value was
    /// written, false when the key already existed.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key; true when it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomic compare-then-delete: delete only while the stored value equals
    /// `expected`. Returns true when the delete happened.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// List keys starting with `prefix` (without any backend namespace).
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomic admission script: if the counter at `counter_key` is below
    /// `max`, increment it (refreshing its TTL to `counter_ttl`) and record a
    /// lease at `lease_key` holding `deadline` (unix seconds) with a physical
    /// TTL of `lease_ttl`. Returns false when the ceiling is reached.
    #[allow(clippy::too_many_arguments)]
    async fn acquire_slot(
        &self,
        counter_key: &str,
        lease_key: &str,
        max: u32,
        counter_ttl: Duration,
        deadline: i64,
        lease_ttl: Duration,
    ) -> Result<bool>;

    /// Atomic release script: delete the lease; only if it existed, decrement
    /// the counter (never below zero). Returns true when a lease was removed.
    async fn release_slot(&self, counter_key: &str, lease_key: &str) -> Result<bool>;
}
