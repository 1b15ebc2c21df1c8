//! Session descriptor: the single source of truth for counters, status and
//! timestamps.
//!
//! The descriptor is one opaque blob under `{prefix}:meta`, always rewritten
//! whole. Writes are optimistic: [`MetadataManager::store`] only succeeds if
//! the stored `version` still matches the one the caller read, and bumps it.

use chrono::{DateTime, Utc};
use dp_core::{
    ConfigRecord, DatasetId, Error, Result, SessionConfig, SessionStatus, Shape, UserId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{decode_record, encode_record};
use crate::context::SessionContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub user_id: UserId,
    pub dataset_id: DatasetId,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub original_shape: Shape,
    pub current_shape: Shape,
    pub current_step: u64,
    pub total_operations: u64,
    /// Lowest ledger step still retained.
    #[serde(default)]
    pub history_start: u64,
    pub status: SessionStatus,
    /// Optimistic concurrency counter, bumped on every write.
    #[serde(default)]
    pub version: u64,
    pub config: ConfigRecord,
}

impl SessionDescriptor {
    pub fn config(&self) -> &SessionConfig {
        self.config.config()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_accessed
            .checked_add_signed(self.config().timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// The entry at `current_step - 1` must still be in the ledger.
    pub fn can_undo(&self) -> bool {
        self.current_step > self.history_start
    }

    pub fn can_redo(&self) -> bool {
        self.current_step < self.total_operations
    }

    /// Number of ledger entries still retained.
    pub fn history_len(&self) -> u64 {
        self.total_operations.saturating_sub(self.history_start)
    }
}

pub struct MetadataManager {
    ctx: SessionContext,
}

impl MetadataManager {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Build a fresh descriptor at step 0. Nothing is persisted.
    pub fn create(
        &self,
        user_id: &str,
        dataset_id: &str,
        shape: Shape,
        config: SessionConfig,
    ) -> SessionDescriptor {
        let now = Utc::now();
        SessionDescriptor {
            user_id: user_id.to_string(),
            dataset_id: dataset_id.to_string(),
            created_at: now,
            last_accessed: now,
            original_shape: shape,
            current_shape: shape,
            current_step: 0,
            total_operations: 0,
            history_start: 0,
            status: SessionStatus::Active,
            version: 0,
            config: ConfigRecord::current(config),
        }
    }

    pub async fn get(&self) -> Result<Option<SessionDescriptor>> {
        Ok(self.load().await?.map(|(_, descriptor)| descriptor))
    }

    /// Persist `descriptor` if nobody else wrote since it was read.
    ///
    /// Returns the stored descriptor with its bumped `version`.
    pub async fn store(&self, descriptor: SessionDescriptor) -> Result<SessionDescriptor> {
        let key = self.ctx.keys.meta();
        let ttl = descriptor.config().ttl();

        let Some((raw, stored)) = self.load().await? else {
            if descriptor.version != 0 {
                return Err(Error::NotFound(format!(
                    "session descriptor {key} vanished before write"
                )));
            }
            let next = SessionDescriptor {
                version: 1,
                ..descriptor
            };
            let bytes = encode_record(self.ctx.codec.as_ref(), &next)?;
            if !self.ctx.store.set_if_absent(&key, &bytes, ttl).await? {
                return Err(Error::Conflict(format!("{key} was created concurrently")));
            }
            return Ok(next);
        };

        if stored.version != descriptor.version {
            warn!(
                key = %key,
                expected = descriptor.version,
                found = stored.version,
                "descriptor version mismatch"
            );
            return Err(Error::Conflict(format!(
                "{key} is at version {}, write was based on {}",
                stored.version, descriptor.version
            )));
        }

        let next = SessionDescriptor {
            version: descriptor.version + 1,
            ..descriptor
        };
        let bytes = encode_record(self.ctx.codec.as_ref(), &next)?;
        if !self
            .ctx
            .store
            .compare_and_swap(&key, &raw, &bytes, ttl)
            .await?
        {
            return Err(Error::Conflict(format!("{key} changed during write")));
        }
        debug!(key = %key, version = next.version, step = next.current_step, "descriptor stored");
        Ok(next)
    }

    /// Unconditional write used when a session is (re)created. The version
    /// continues past any descriptor it overwrites so stale writers still
    /// conflict.
    pub async fn replace(&self, descriptor: SessionDescriptor) -> Result<SessionDescriptor> {
        let key = self.ctx.keys.meta();
        let previous = match self.load().await {
            Ok(found) => found.map_or(0, |(_, d)| d.version),
            Err(Error::Serialization(_)) => 0,
            Err(e) => return Err(e),
        };
        let next = SessionDescriptor {
            version: previous.max(descriptor.version) + 1,
            ..descriptor
        };
        let bytes = encode_record(self.ctx.codec.as_ref(), &next)?;
        self.ctx
            .store
            .set(&key, &bytes, next.config().ttl())
            .await?;
        Ok(next)
    }

    pub fn is_expired(&self, descriptor: &SessionDescriptor) -> bool {
        descriptor.is_expired_at(Utc::now())
    }

    pub fn expiration_time(&self, descriptor: &SessionDescriptor) -> DateTime<Utc> {
        descriptor.expires_at()
    }

    /// Refresh `last_accessed` and the TTLs of the descriptor and of both
    /// anchor snapshots. Returns `None` when there is no descriptor.
    pub async fn touch(&self) -> Result<Option<SessionDescriptor>> {
        let Some(descriptor) = self.get().await? else {
            return Ok(None);
        };
        let touched = self
            .store(SessionDescriptor {
                last_accessed: Utc::now(),
                ..descriptor
            })
            .await?;
        self.refresh_snapshot_ttls(&touched).await?;
        Ok(Some(touched))
    }

    /// Extend the TTL of both snapshots and of every retained ledger entry,
    /// `[history_start, total_operations)`, so nothing the session can still
    /// reach expires while it is in use.
    pub async fn refresh_snapshot_ttls(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let ttl = descriptor.config().ttl();
        for key in [self.ctx.keys.current(), self.ctx.keys.original()] {
            if !self.ctx.store.expire(&key, ttl).await? {
                debug!(key = %key, "snapshot missing while refreshing ttl");
            }
        }
        let mut missing = 0usize;
        for step in descriptor.history_start..descriptor.total_operations {
            for key in self.ctx.keys.entry_keys(step) {
                if !self.ctx.store.expire(&key, ttl).await? {
                    missing += 1;
                }
            }
        }
        if missing > 0 {
            debug!(missing, "ledger keys missing while refreshing ttl");
        }
        Ok(())
    }

    pub async fn delete(&self) -> Result<bool> {
        self.ctx.store.delete(&self.ctx.keys.meta()).await
    }

    async fn load(&self) -> Result<Option<(Vec<u8>, SessionDescriptor)>> {
        let Some(raw) = self.ctx.store.get(&self.ctx.keys.meta()).await? else {
            return Ok(None);
        };
        let descriptor = decode_record(self.ctx.codec.as_ref(), &raw)?;
        Ok(Some((raw, descriptor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn manager() -> MetadataManager {
        MetadataManager::new(SessionContext::in_memory("test", "alice", "sales"))
    }

    #[tokio::test]
    async fn first_store_sets_version_one() {
        let meta = manager();
        let created = meta.create("alice", "sales", Shape::new(5, 2), SessionConfig::default());
        assert_eq!(created.version, 0);
        let stored = meta.store(created).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(meta.get().await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let meta = manager();
        let created = meta.create("alice", "sales", Shape::new(5, 2), SessionConfig::default());
        let v1 = meta.store(created).await.unwrap();
        let stale = v1.clone();

        let v2 = meta
            .store(SessionDescriptor {
                current_step: 1,
                total_operations: 1,
                ..v1
            })
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let err = meta.store(stale).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert_eq!(meta.get().await.unwrap().unwrap().current_step, 1);
    }

    #[tokio::test]
    async fn replace_continues_version_sequence() {
        let meta = manager();
        let created = meta.create("alice", "sales", Shape::new(5, 2), SessionConfig::default());
        let v1 = meta.store(created.clone()).await.unwrap();
        let replaced = meta.replace(created).await.unwrap();
        assert_eq!(replaced.version, 2);
        assert!(meta.store(v1).await.is_err());
    }

    #[tokio::test]
    async fn store_after_vanish_is_not_found() {
        let meta = manager();
        let created = meta.create("alice", "sales", Shape::new(5, 2), SessionConfig::default());
        let stored = meta.store(created).await.unwrap();
        assert!(meta.delete().await.unwrap());
        assert!(meta.store(stored).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn touch_moves_last_accessed_forward() {
        let meta = manager();
        let created = meta.create("alice", "sales", Shape::new(5, 2), SessionConfig::default());
        let stored = meta
            .store(SessionDescriptor {
                last_accessed: created.last_accessed - TimeDelta::minutes(5),
                ..created
            })
            .await
            .unwrap();
        let touched = meta.touch().await.unwrap().unwrap();
        assert!(touched.last_accessed > stored.last_accessed);
        assert_eq!(touched.version, stored.version + 1);
    }

    #[tokio::test]
    async fn touch_keeps_ledger_entries_alive() {
        let meta = manager();
        let created = meta.create("alice", "sales", Shape::new(5, 2), SessionConfig::default());
        meta.store(SessionDescriptor {
            current_step: 1,
            total_operations: 1,
            ..created
        })
        .await
        .unwrap();
        let short = std::time::Duration::from_millis(50);
        for key in meta.ctx.keys.entry_keys(0) {
            meta.ctx.store.set(&key, b"entry", short).await.unwrap();
        }

        meta.touch().await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        for key in meta.ctx.keys.entry_keys(0) {
            assert!(meta.ctx.store.get(&key).await.unwrap().is_some(), "{key}");
        }
    }

    #[tokio::test]
    async fn touch_without_session_is_none() {
        assert!(manager().touch().await.unwrap().is_none());
    }

    #[test]
    fn expiry_is_strictly_after_timeout() {
        let meta = manager();
        let config = SessionConfig {
            timeout_minutes: 10,
            ..SessionConfig::default()
        };
        let d = meta.create("alice", "sales", Shape::new(1, 1), config);
        let deadline = meta.expiration_time(&d);
        assert_eq!(deadline, d.last_accessed + TimeDelta::minutes(10));
        assert!(!d.is_expired_at(deadline));
        assert!(d.is_expired_at(deadline + TimeDelta::seconds(1)));
        assert!(!meta.is_expired(&d));
    }

    #[test]
    fn undo_redo_flags_follow_counters() {
        let meta = manager();
        let mut d = meta.create("alice", "sales", Shape::new(1, 1), SessionConfig::default());
        assert!(!d.can_undo());
        assert!(!d.can_redo());

        d.current_step = 3;
        d.total_operations = 5;
        d.history_start = 3;
        assert!(!d.can_undo());
        assert!(d.can_redo());
        assert_eq!(d.history_len(), 2);
    }
}
