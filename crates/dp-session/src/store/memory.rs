//! In-process cache store backed by DashMap.
//!
//! Default backend for tests and single-process deployments. Expiry is lazy:
//! an entry past its deadline is dropped when it is next touched, or in bulk
//! by [`MemoryStore::purge_expired`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dp_core::Result;
use std::time::{Duration, Instant};

use super::CacheStore;

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(bytes: &[u8], ttl: Duration) -> Self {
        Self {
            bytes: bytes.to_vec(),
            expires_at: deadline(ttl),
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

fn deadline(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, value| value.is_live());
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_live() {
            return Ok(Some(entry.bytes.clone()));
        }
        drop(entry);
        self.entries.remove_if(key, |_, value| !value.is_live());
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, value)| value.is_live()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live() => {
                entry.expires_at = deadline(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live() && entry.bytes == expected => {
                *entry = StoredValue::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, value| value.is_live() && value.bytes == expected)
            .is_some())
    }
}
