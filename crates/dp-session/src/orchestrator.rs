//! [`TransformSession`]: the session API callers use.
//!
//! One value is bound to a single (scope, user, dataset). It holds no session
//! state of its own; every call re-reads the store. Mutating calls run under
//! the per-session write lease and fail with [`Error::Conflict`] while
//! another request holds it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dp_core::{DataFrame, Error, OperationParams, Result, SessionConfig, SessionStatus, Shape};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::codec::{JsonCodec, SnapshotCodec};
use crate::context::SessionContext;
use crate::history::{HistoryEntry, HistoryLedger};
use crate::initializer::Initializer;
use crate::lease::SessionLease;
use crate::lifecycle::Lifecycle;
use crate::metadata::{MetadataManager, SessionDescriptor};
use crate::store::{CacheStore, MemoryStore, SessionKeys};
use crate::transformer::Transformer;

/// Session state for display, as returned by
/// [`TransformSession::get_session_info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub dataset_id: String,
    pub session_exists: bool,
    pub is_expired: bool,
    /// Present whenever a descriptor was found, expired or not.
    #[serde(flatten)]
    pub details: Option<SessionDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetails {
    pub current_shape: Shape,
    pub original_shape: Shape,
    pub current_step: u64,
    pub total_operations: u64,
    pub can_undo: bool,
    pub can_redo: bool,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub history_len: u64,
    pub config: SessionConfig,
}

impl From<&SessionDescriptor> for SessionDetails {
    fn from(d: &SessionDescriptor) -> Self {
        Self {
            current_shape: d.current_shape,
            original_shape: d.original_shape,
            current_step: d.current_step,
            total_operations: d.total_operations,
            can_undo: d.can_undo(),
            can_redo: d.can_redo(),
            status: d.status,
            created_at: d.created_at,
            last_accessed: d.last_accessed,
            expires_at: d.expires_at(),
            history_len: d.history_len(),
            config: d.config().clone(),
        }
    }
}

pub struct TransformSession {
    ctx: SessionContext,
    config: SessionConfig,
    initializer: Initializer,
    metadata: MetadataManager,
    ledger: HistoryLedger,
    transformer: Transformer,
    lifecycle: Lifecycle,
}

impl TransformSession {
    /// `config` applies to sessions this value creates. Existing sessions
    /// keep the config recorded in their descriptor.
    pub fn new(
        store: Arc<dyn CacheStore>,
        codec: Arc<dyn SnapshotCodec>,
        scope: &str,
        user_id: &str,
        dataset_id: &str,
        config: SessionConfig,
    ) -> Self {
        let ctx = SessionContext::new(store, codec, SessionKeys::new(scope, user_id, dataset_id));
        Self::with_context(ctx, config)
    }

    /// Like [`new`](Self::new) with a [`JsonCodec`] built from `config`.
    pub fn from_config(
        store: Arc<dyn CacheStore>,
        scope: &str,
        user_id: &str,
        dataset_id: &str,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Arc::new(JsonCodec::from_config(&config)?);
        Ok(Self::new(store, codec, scope, user_id, dataset_id, config))
    }

    /// A session over a private [`MemoryStore`].
    pub fn in_memory(scope: &str, user_id: &str, dataset_id: &str) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(JsonCodec::default()),
            scope,
            user_id,
            dataset_id,
            SessionConfig::default(),
        )
    }

    pub fn with_context(ctx: SessionContext, config: SessionConfig) -> Self {
        Self {
            initializer: Initializer::new(ctx.clone()),
            metadata: MetadataManager::new(ctx.clone()),
            ledger: HistoryLedger::new(ctx.clone()),
            transformer: Transformer::new(ctx.clone()),
            lifecycle: Lifecycle::new(ctx.clone()),
            ctx,
            config,
        }
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.ctx.keys
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Session API ──────────────────────────────────────────────────

    pub async fn initialize_session(&self, frame: &DataFrame, force: bool) -> Result<()> {
        let result = self
            .locked(|| self.initializer.initialize(frame, force, self.config.clone()))
            .await;
        self.report("initialize_session", result.map(drop))
    }

    pub async fn session_exists(&self) -> Result<bool> {
        let result = self.initializer.exists().await;
        self.report("session_exists", result)
    }

    /// `None` when there is no live session or its current snapshot is gone.
    pub async fn get_current_dataframe(&self) -> Result<Option<DataFrame>> {
        let result = self.read_snapshot(self.ctx.keys.current()).await;
        self.report("get_current_dataframe", result)
    }

    pub async fn get_original_dataframe(&self) -> Result<Option<DataFrame>> {
        let result = self.read_snapshot(self.ctx.keys.original()).await;
        self.report("get_original_dataframe", result)
    }

    /// Make `frame` the current state, recording it as `operation_name`
    /// applied to the previous one.
    pub async fn apply_transformation(
        &self,
        frame: &DataFrame,
        operation_name: &str,
        operation_params: OperationParams,
    ) -> Result<()> {
        let result = self
            .locked(|| async {
                let descriptor = self.initializer.load_live().await?;
                self.transformer
                    .apply(descriptor, frame, operation_name, operation_params)
                    .await
            })
            .await;
        self.report("apply_transformation", result.map(drop))
    }

    /// The restored frame, or `None` when there is nothing left to undo.
    pub async fn undo_operation(&self) -> Result<Option<DataFrame>> {
        let result = self
            .locked(|| async {
                let descriptor = self.initializer.load_live().await?;
                self.transformer.undo(descriptor).await
            })
            .await;
        self.report("undo_operation", result)
    }

    pub async fn redo_operation(&self) -> Result<Option<DataFrame>> {
        let result = self
            .locked(|| async {
                let descriptor = self.initializer.load_live().await?;
                self.transformer.redo(descriptor).await
            })
            .await;
        self.report("redo_operation", result)
    }

    pub async fn reset_to_original(&self) -> Result<()> {
        let result = self
            .locked(|| async {
                let descriptor = self.initializer.load_live().await?;
                self.lifecycle.reset_to_original(descriptor).await
            })
            .await;
        self.report("reset_to_original", result.map(drop))
    }

    pub async fn pause_session(&self) -> Result<()> {
        let result = self
            .locked(|| async {
                let descriptor = self.initializer.load_live().await?;
                self.lifecycle.pause(descriptor).await
            })
            .await;
        self.report("pause_session", result.map(drop))
    }

    pub async fn resume_session(&self) -> Result<()> {
        let result = self
            .locked(|| async {
                let descriptor = self.initializer.load_live().await?;
                self.lifecycle.resume(descriptor).await
            })
            .await;
        self.report("resume_session", result.map(drop))
    }

    /// Delete every key of the session, the write lease included. Does not
    /// wait for or respect a held lease.
    pub async fn clear_session(&self) -> Result<()> {
        let result = self.initializer.teardown().await;
        if let Ok(removed) = &result {
            info!(
                user = %self.ctx.keys.user_id(),
                dataset = %self.ctx.keys.dataset_id(),
                removed,
                "session cleared"
            );
        }
        self.report("clear_session", result.map(drop))
    }

    pub async fn get_session_info(&self) -> Result<SessionInfo> {
        let result = self.session_info().await;
        self.report("get_session_info", result)
    }

    /// Up to `limit` history records behind the current step, most recent
    /// first. Empty when there is no live session.
    pub async fn get_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let result = match self.load_live_opt().await {
            Ok(Some(d)) => {
                self.ledger
                    .get_summary(d.history_start, d.current_step, limit)
                    .await
            }
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        self.report("get_history", result)
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Run `op` while holding the write lease.
    ///
    /// Release needs an await, so a caller that drops this future mid-call
    /// leaves the lease held until `lock_ttl_seconds` runs out. Writers get
    /// [`Error::Conflict`] until then.
    async fn locked<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lease = SessionLease::acquire(&self.ctx, self.config.lock_ttl()).await?;
        let result = op().await;
        lease.release(&self.ctx).await;
        result
    }

    async fn load_live_opt(&self) -> Result<Option<SessionDescriptor>> {
        match self.initializer.load_live().await {
            Ok(d) => Ok(Some(d)),
            Err(Error::NotFound(_) | Error::Expired(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_snapshot(&self, key: String) -> Result<Option<DataFrame>> {
        if self.load_live_opt().await?.is_none() {
            return Ok(None);
        }
        let Some(bytes) = self.ctx.store.get(&key).await? else {
            warn!(key = %key, "snapshot missing from a live session");
            return Ok(None);
        };
        let frame = self.ctx.codec.decode_frame(&bytes)?;
        self.touch_if_idle().await;
        Ok(Some(frame))
    }

    /// Refresh `last_accessed` unless a writer holds the lease. Failures are
    /// logged, never returned.
    async fn touch_if_idle(&self) {
        let lease = match SessionLease::try_acquire(&self.ctx, self.config.lock_ttl()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("skipping touch while the session is being written");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not take lease for touch");
                return;
            }
        };
        if let Err(e) = self.metadata.touch().await {
            warn!(error = %e, "failed to refresh session access time");
        }
        lease.release(&self.ctx).await;
    }

    async fn session_info(&self) -> Result<SessionInfo> {
        let descriptor = self.metadata.get().await?;
        let is_expired = descriptor
            .as_ref()
            .is_some_and(|d| self.metadata.is_expired(d));
        if is_expired {
            // Purges the session when its config asks for it.
            if let Err(e) = self.initializer.load_live().await {
                debug!(error = %e, "expired session observed by info");
            }
        }
        Ok(SessionInfo {
            user_id: self.ctx.keys.user_id().to_string(),
            dataset_id: self.ctx.keys.dataset_id().to_string(),
            session_exists: descriptor.is_some() && !is_expired,
            is_expired,
            details: descriptor.as_ref().map(SessionDetails::from),
        })
    }

    fn report<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let user = self.ctx.keys.user_id();
            let dataset = self.ctx.keys.dataset_id();
            match e {
                Error::Storage(_) | Error::Serialization(_) | Error::Internal(_) => {
                    error!(operation, user, dataset, error = %e, "session operation failed")
                }
                _ => warn!(operation, user, dataset, error = %e, "session operation rejected"),
            }
        }
        result
    }
}
