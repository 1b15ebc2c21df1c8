//! Per-session write lease.
//!
//! Mutating operations take `{prefix}:lock` with set-if-absent and a random
//! token. A held lease fails the caller fast with [`Error::Conflict`]; there
//! is no waiting. The lease expires on its own after `lock_ttl_seconds` if
//! the holder dies or its future is dropped before [`SessionLease::release`]
//! runs, and release only deletes the key while it still holds the holder's
//! token.

use dp_core::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::SessionContext;

#[must_use = "a lease must be released"]
pub struct SessionLease {
    key: String,
    token: String,
}

impl SessionLease {
    pub async fn acquire(ctx: &SessionContext, ttl: Duration) -> Result<Self> {
        Self::try_acquire(ctx, ttl).await?.ok_or_else(|| {
            Error::Conflict(format!(
                "session {}/{} is being modified by another request",
                ctx.keys.user_id(),
                ctx.keys.dataset_id()
            ))
        })
    }

    /// `None` when another holder has the lease.
    pub async fn try_acquire(ctx: &SessionContext, ttl: Duration) -> Result<Option<Self>> {
        let key = ctx.keys.lock();
        let token = Uuid::new_v4().to_string();
        if !ctx.store.set_if_absent(&key, token.as_bytes(), ttl).await? {
            debug!(key = %key, "lease busy");
            return Ok(None);
        }
        Ok(Some(Self { key, token }))
    }

    pub async fn release(self, ctx: &SessionContext) {
        match ctx
            .store
            .compare_and_delete(&self.key, self.token.as_bytes())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(key = %self.key, "lease expired or was taken over before release"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to release lease"),
        }
    }
}
