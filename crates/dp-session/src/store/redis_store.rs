//! Redis-backed cache store.
//!
//! Available only when the `redis` cargo feature is enabled.
//! Values are written with `SET ... PX` so Redis expires them on its own.
//! The conditional primitives run as Lua scripts, which Redis executes
//! atomically.

use async_trait::async_trait;
use dp_core::{Error, Result};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

use super::CacheStore;

const COMPARE_AND_SWAP: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
end
return 0
";

const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const SCAN_BATCH: usize = 500;

/// Redis-backed cache store.
///
/// Uses `redis::aio::ConnectionManager` which automatically reconnects on
/// transient failures and is cheaply cloneable.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    compare_and_swap: redis::Script,
    compare_and_delete: redis::Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// `redis_url` is a standard Redis connection string, e.g.
    /// `redis://127.0.0.1:6379`.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(storage_error)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(storage_error)?;
        Ok(Self {
            conn,
            compare_and_swap: redis::Script::new(COMPARE_AND_SWAP),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }
}

fn storage_error(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

/// Redis rejects `PX 0`; sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('*');
    out
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!("Redis SET failed for {key}: {e}");
                storage_error(e)
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| {
            warn!("Redis GET failed for {key}: {e}");
            storage_error(e)
        })?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(storage_error)?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(keys.to_vec())
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(updated == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // SCAN rather than KEYS so a large keyspace never blocks the server.
        let mut conn = self.conn.clone();
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!("Redis SCAN failed for {pattern}: {e}");
                    storage_error(e)
                })?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(removed == 1)
    }
}
