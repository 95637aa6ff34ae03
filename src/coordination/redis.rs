// src/coordination/redis.rs

use crate::coordination::CoordinationStore;
use crate::error::Result;
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::trace;

/// Compare-then-delete: only the caller whose value is still stored may
/// delete the entry.
static DELETE_IF_EQUALS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end
        ",
    )
});

/// Admission acquire: counter check, increment and lease write as one script.
static ACQUIRE_SLOT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local count = tonumber(redis.call('GET', KEYS[1]) or '0')
        if count >= tonumber(ARGV[1]) then
            return 0
        end
        redis.call('INCR', KEYS[1])
        redis.call('EXPIRE', KEYS[1], ARGV[2])
        redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[4])
        return 1
        ",
    )
});

/// Admission release: decrement only when the lease still existed.
static RELEASE_SLOT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('DEL', KEYS[2]) == 0 then
            return 0
        end
        local count = tonumber(redis.call('GET', KEYS[1]) or '0')
        if count > 0 then
            redis.call('DECR', KEYS[1])
        end
        return 1
        ",
    )
});

/// Redis implementation of the coordination store.
///
/// All keys are namespaced with a configurable prefix so several pools can
/// share one Redis instance.
pub struct RedisCoordinationStore {
    pool: Pool,
    key_prefix: String,
}

impl RedisCoordinationStore {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
        }
    }

    fn prefix_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn get_connection(&self) -> Result<Connection> {
        self.pool.get().await.map_err(Into::into)
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(self.prefix_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(self.prefix_key(key), value, Self::ttl_secs(ttl))
                    .await?;
            }
            None => {
                let _: () = conn.set(self.prefix_key(key), value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        // SET NX EX is the single atomic acquire primitive.
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.prefix_key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn.del(self.prefix_key(key)).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = DELETE_IF_EQUALS
            .key(self.prefix_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let pattern = format!("{}{}*", self.key_prefix, prefix);
        let keys: Vec<String> = conn.keys(&pattern).await?;
        trace!(pattern = %pattern, count = keys.len(), "Scanned coordination keys");
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string))
            .collect())
    }

    async fn acquire_slot(
        &self,
        counter_key: &str,
        lease_key: &str,
        max: u32,
        counter_ttl: Duration,
        deadline: i64,
        lease_ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let admitted: i64 = ACQUIRE_SLOT
            .key(self.prefix_key(counter_key))
            .key(self.prefix_key(lease_key))
            .arg(max)
            .arg(Self::ttl_secs(counter_ttl))
            .arg(deadline)
            .arg(Self::ttl_secs(lease_ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted > 0)
    }

    async fn release_slot(&self, counter_key: &str, lease_key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let released: i64 = RELEASE_SLOT
            .key(self.prefix_key(counter_key))
            .key(self.prefix_key(lease_key))
            .invoke_async(&mut conn)
            .await?;
        Ok(released > 0)
    }
}
