//! Session creation, liveness checks and teardown.

use std::sync::Arc;

use dp_core::{DataFrame, Error, Result, SessionConfig};
use tracing::{info, warn};

use crate::codec::{decode_record, SnapshotCodec};
use crate::context::SessionContext;
use crate::metadata::{MetadataManager, SessionDescriptor};
use crate::store::{CacheStore, SessionKeys};

pub struct Initializer {
    ctx: SessionContext,
    metadata: MetadataManager,
}

impl Initializer {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            metadata: MetadataManager::new(ctx.clone()),
            ctx,
        }
    }

    /// Store `frame` as both original and current snapshot and write a fresh
    /// descriptor at step 0.
    ///
    /// Fails with [`Error::AlreadyExists`] if a live session is present and
    /// `force` is false. Any earlier session under the same ids, live or
    /// expired, is purged first.
    pub async fn initialize(
        &self,
        frame: &DataFrame,
        force: bool,
        config: SessionConfig,
    ) -> Result<SessionDescriptor> {
        config.validate()?;

        let previous_version = match self.metadata.get().await {
            Ok(Some(existing)) => {
                if !force && !self.metadata.is_expired(&existing) {
                    return Err(Error::AlreadyExists(format!(
                        "{}/{} at step {}",
                        existing.user_id, existing.dataset_id, existing.current_step
                    )));
                }
                existing.version
            }
            Ok(None) => 0,
            Err(e) if force && e.requires_clear() => {
                warn!(error = %e, "overwriting unreadable session descriptor");
                0
            }
            Err(e) => return Err(e),
        };

        let purged = self.purge().await?;
        if purged > 0 {
            info!(
                user = %self.ctx.keys.user_id(),
                dataset = %self.ctx.keys.dataset_id(),
                purged,
                "replaced previous session"
            );
        }

        let bytes = self.ctx.codec.encode_frame(frame)?;
        let ttl = config.ttl();
        self.ctx
            .store
            .set(&self.ctx.keys.original(), &bytes, ttl)
            .await?;
        self.ctx
            .store
            .set(&self.ctx.keys.current(), &bytes, ttl)
            .await?;

        let descriptor = SessionDescriptor {
            version: previous_version,
            ..self.metadata.create(
                self.ctx.keys.user_id(),
                self.ctx.keys.dataset_id(),
                frame.shape(),
                config,
            )
        };
        let stored = self.metadata.replace(descriptor).await?;
        info!(
            user = %stored.user_id,
            dataset = %stored.dataset_id,
            shape = %stored.original_shape,
            "session initialized"
        );
        Ok(stored)
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.load_live().await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_) | Error::Expired(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The descriptor of a live session.
    ///
    /// [`Error::NotFound`] without a descriptor, [`Error::Expired`] past the
    /// idle timeout. An expired session is purged first when its config has
    /// `cleanup_on_timeout`.
    pub async fn load_live(&self) -> Result<SessionDescriptor> {
        let Some(descriptor) = self.metadata.get().await? else {
            return Err(Error::NotFound(format!(
                "no session for {}/{}",
                self.ctx.keys.user_id(),
                self.ctx.keys.dataset_id()
            )));
        };
        if self.metadata.is_expired(&descriptor) {
            if descriptor.config().cleanup_on_timeout {
                let purged = self.purge().await?;
                info!(
                    user = %descriptor.user_id,
                    dataset = %descriptor.dataset_id,
                    purged,
                    "expired session purged"
                );
            }
            return Err(Error::Expired(format!(
                "{}/{} idle since {}",
                descriptor.user_id, descriptor.dataset_id, descriptor.last_accessed
            )));
        }
        Ok(descriptor)
    }

    /// Delete every key of the session except the write lease.
    pub async fn purge(&self) -> Result<usize> {
        let lock = self.ctx.keys.lock();
        let keys: Vec<String> = self
            .ctx
            .store
            .keys_with_prefix(&self.ctx.keys.session_prefix())
            .await?
            .into_iter()
            .filter(|key| *key != lock)
            .collect();
        self.ctx.store.delete_many(&keys).await
    }

    /// Purge including the write lease.
    pub async fn teardown(&self) -> Result<usize> {
        let purged = self.purge().await?;
        let lock = usize::from(self.ctx.store.delete(&self.ctx.keys.lock()).await?);
        Ok(purged + lock)
    }
}

/// Descriptors of every session stored under `scope`. Unreadable descriptors
/// are logged and skipped.
pub async fn list_sessions(
    store: &dyn CacheStore,
    codec: &dyn SnapshotCodec,
    scope: &str,
) -> Result<Vec<SessionDescriptor>> {
    let mut sessions = Vec::new();
    for key in store.keys_with_prefix(&SessionKeys::scope_prefix(scope)).await? {
        if SessionKeys::parse_meta_key(scope, &key).is_none() {
            continue;
        }
        let Some(raw) = store.get(&key).await? else {
            continue;
        };
        match decode_record::<SessionDescriptor>(codec, &raw) {
            Ok(descriptor) => sessions.push(descriptor),
            Err(e) => warn!(key = %key, error = %e, "skipping unreadable descriptor"),
        }
    }
    Ok(sessions)
}

/// Purge every expired session under `scope`, regardless of its
/// `cleanup_on_timeout` setting. Returns the keys of the purged sessions.
pub async fn sweep_expired(
    store: &Arc<dyn CacheStore>,
    codec: &Arc<dyn SnapshotCodec>,
    scope: &str,
) -> Result<Vec<SessionKeys>> {
    let now = chrono::Utc::now();
    let mut purged = Vec::new();
    for descriptor in list_sessions(store.as_ref(), codec.as_ref(), scope).await? {
        if !descriptor.is_expired_at(now) {
            continue;
        }
        let keys = SessionKeys::new(scope, &descriptor.user_id, &descriptor.dataset_id);
        let ctx = SessionContext::new(Arc::clone(store), Arc::clone(codec), keys.clone());
        let removed = Initializer::new(ctx).purge().await?;
        info!(
            user = %descriptor.user_id,
            dataset = %descriptor.dataset_id,
            removed,
            "swept expired session"
        );
        purged.push(keys);
    }
    Ok(purged)
}
