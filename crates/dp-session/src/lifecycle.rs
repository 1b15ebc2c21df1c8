//! Pause, resume and reset.

use chrono::Utc;
use dp_core::{Error, Result, SessionStatus};
use tracing::{info, warn};

use crate::context::SessionContext;
use crate::history::HistoryLedger;
use crate::metadata::{MetadataManager, SessionDescriptor};
use crate::transformer::ensure_active;

pub struct Lifecycle {
    ctx: SessionContext,
    metadata: MetadataManager,
    ledger: HistoryLedger,
}

impl Lifecycle {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            metadata: MetadataManager::new(ctx.clone()),
            ledger: HistoryLedger::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn pause(&self, descriptor: SessionDescriptor) -> Result<SessionDescriptor> {
        ensure_active(&descriptor, "pause")?;
        self.set_status(descriptor, SessionStatus::Paused).await
    }

    pub async fn resume(&self, descriptor: SessionDescriptor) -> Result<SessionDescriptor> {
        if descriptor.status != SessionStatus::Paused {
            return Err(Error::InvalidState(format!(
                "cannot resume: session {}/{} is {}",
                descriptor.user_id, descriptor.dataset_id, descriptor.status
            )));
        }
        self.set_status(descriptor, SessionStatus::Active).await
    }

    /// Make the original snapshot current again and drop the whole ledger.
    /// Identity, `created_at` and config are kept; a paused session becomes
    /// active.
    pub async fn reset_to_original(
        &self,
        descriptor: SessionDescriptor,
    ) -> Result<SessionDescriptor> {
        let keys = &self.ctx.keys;
        let ttl = descriptor.config().ttl();
        let original = self.ctx.store.get(&keys.original()).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "original snapshot of {}/{} is missing",
                descriptor.user_id, descriptor.dataset_id
            ))
        })?;
        let previous = self.ctx.store.get(&keys.current()).await?;
        self.ctx.store.set(&keys.current(), &original, ttl).await?;

        let next = SessionDescriptor {
            current_step: 0,
            total_operations: 0,
            history_start: 0,
            current_shape: descriptor.original_shape,
            status: SessionStatus::Active,
            last_accessed: Utc::now(),
            ..descriptor
        };
        let committed = match self.metadata.store(next).await {
            Ok(committed) => committed,
            Err(e) => {
                if let Some(bytes) = previous {
                    if let Err(restore) = self.ctx.store.set(&keys.current(), &bytes, ttl).await {
                        warn!(error = %restore, "failed to restore current snapshot");
                    }
                }
                return Err(e);
            }
        };

        match self.ledger.clear_all().await {
            Ok(removed) => info!(
                user = %committed.user_id,
                dataset = %committed.dataset_id,
                removed,
                "session reset to original"
            ),
            Err(e) => warn!(error = %e, "session reset but ledger cleanup failed"),
        }
        self.metadata.refresh_snapshot_ttls(&committed).await?;
        Ok(committed)
    }

    async fn set_status(
        &self,
        descriptor: SessionDescriptor,
        status: SessionStatus,
    ) -> Result<SessionDescriptor> {
        let committed = self
            .metadata
            .store(SessionDescriptor {
                status,
                last_accessed: Utc::now(),
                ..descriptor
            })
            .await?;
        self.metadata.refresh_snapshot_ttls(&committed).await?;
        info!(
            user = %committed.user_id,
            dataset = %committed.dataset_id,
            status = %committed.status,
            "session status changed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::Initializer;
    use crate::transformer::Transformer;
    use dp_core::{Column, ColumnData, DataFrame, OperationParams, SessionConfig};

    fn frame(label: &str) -> DataFrame {
        DataFrame::new(vec![Column::new(
            "label",
            ColumnData::Utf8(vec![Some(label.to_string()), None]),
        )])
        .unwrap()
    }

    async fn setup() -> (Lifecycle, MetadataManager, SessionContext) {
        let ctx = SessionContext::in_memory("test", "alice", "sales");
        Initializer::new(ctx.clone())
            .initialize(&frame("raw"), false, SessionConfig::default())
            .await
            .unwrap();
        (
            Lifecycle::new(ctx.clone()),
            MetadataManager::new(ctx.clone()),
            ctx,
        )
    }

    #[tokio::test]
    async fn pause_and_resume_alternate() {
        let (lifecycle, meta, _) = setup().await;
        let d = meta.get().await.unwrap().unwrap();
        let paused = lifecycle.pause(d).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        let err = lifecycle.pause(paused.clone()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let resumed = lifecycle.resume(paused).await.unwrap();
        assert!(resumed.is_active());
        assert!(lifecycle.resume(resumed).await.is_err());
    }

    #[tokio::test]
    async fn reset_drops_ledger_and_reactivates() {
        let (lifecycle, meta, ctx) = setup().await;
        let transformer = Transformer::new(ctx.clone());
        for label in ["a", "b"] {
            let d = meta.get().await.unwrap().unwrap();
            transformer
                .apply(d, &frame(label), "relabel", OperationParams::new())
                .await
                .unwrap();
        }
        let paused = lifecycle.pause(meta.get().await.unwrap().unwrap()).await.unwrap();

        let reset = lifecycle.reset_to_original(paused).await.unwrap();
        assert_eq!(reset.current_step, 0);
        assert_eq!(reset.total_operations, 0);
        assert!(reset.is_active());
        assert_eq!(
            ctx.store.get(&ctx.keys.current()).await.unwrap(),
            ctx.store.get(&ctx.keys.original()).await.unwrap()
        );
        let prefix = ctx.keys.session_prefix();
        assert!(ctx
            .store
            .keys_with_prefix(&format!("{prefix}history:"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reset_without_original_is_not_found() {
        let (lifecycle, meta, ctx) = setup().await;
        ctx.store.delete(&ctx.keys.original()).await.unwrap();
        let err = lifecycle
            .reset_to_original(meta.get().await.unwrap().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
