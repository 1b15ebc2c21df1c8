//! Trait abstraction for the backing key/value cache.
//!
//! Allows swapping between the in-process [`MemoryStore`] (DashMap) and a
//! Redis-backed store. The store holds opaque bytes with a TTL and knows
//! nothing about sessions; a missing key is always a plain cache miss.

use async_trait::async_trait;
use dp_core::Result;
use std::time::Duration;

mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use keys::SessionKeys;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Trait for cache backends.
///
/// Calls are single-shot: no retries, no multi-key transactions. Backend
/// failures surface as [`dp_core::Error::Storage`].
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Reset the TTL of an existing key. Returns false for a missing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Replace the value only if it still equals `expected`, atomically.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;

    /// Delete the key only if it still holds `expected`, atomically.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;
}
