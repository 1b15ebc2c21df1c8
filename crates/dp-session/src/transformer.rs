//! Apply, undo and redo.
//!
//! Each operation takes the descriptor the caller loaded under the write
//! lease, moves the current snapshot, then commits the descriptor. If the
//! commit fails, the previous current snapshot is put back, along with any
//! ledger entry the operation overwrote.

use std::time::Duration;

use chrono::Utc;
use dp_core::{DataFrame, Error, OperationParams, Result};
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::history::{HistoryEntry, HistoryLedger, SavedEntry};
use crate::metadata::{MetadataManager, SessionDescriptor};

pub struct Transformer {
    ctx: SessionContext,
    metadata: MetadataManager,
    ledger: HistoryLedger,
}

impl Transformer {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            metadata: MetadataManager::new(ctx.clone()),
            ledger: HistoryLedger::new(ctx.clone()),
            ctx,
        }
    }

    /// Record `frame` as the result of `operation_name` on the current
    /// snapshot and make it current.
    ///
    /// Applying after an undo discards the redo branch. Entries beyond
    /// `max_history_entries` are evicted once the descriptor is committed.
    pub async fn apply(
        &self,
        descriptor: SessionDescriptor,
        frame: &DataFrame,
        operation_name: &str,
        operation_params: OperationParams,
    ) -> Result<SessionDescriptor> {
        if operation_name.trim().is_empty() {
            return Err(Error::Validation("operation name must not be empty".into()));
        }
        ensure_active(&descriptor, "apply a transformation")?;

        let keys = &self.ctx.keys;
        let config = descriptor.config().clone();
        let ttl = config.ttl();

        let pre_state = self.ctx.store.get(&keys.current()).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "current snapshot of {}/{} is missing",
                descriptor.user_id, descriptor.dataset_id
            ))
        })?;
        let post_state = self.ctx.codec.encode_frame(frame)?;

        let step = descriptor.current_step;
        let previous_total = descriptor.total_operations;
        let previous_start = descriptor.history_start;
        let total = step + 1;
        let entry = HistoryEntry {
            step,
            operation_name: operation_name.to_string(),
            operation_params,
            timestamp: Utc::now(),
            shape_before: descriptor.current_shape,
            shape_after: frame.shape(),
        };

        // After an undo, `step` still holds the redo target.
        let saved = if step < previous_total {
            self.ledger.save_entry(step).await?
        } else {
            SavedEntry::absent(step)
        };

        let next = SessionDescriptor {
            current_step: total,
            total_operations: total,
            current_shape: entry.shape_after,
            history_start: total
                .saturating_sub(config.max_history_entries)
                .max(previous_start),
            last_accessed: Utc::now(),
            ..descriptor
        };
        let written: Result<SessionDescriptor> = async {
            self.ledger
                .add_entry(&entry, &pre_state, &post_state, ttl)
                .await?;
            self.ctx.store.set(&keys.current(), &post_state, ttl).await?;
            self.metadata.store(next).await
        }
        .await;
        let committed = match written {
            Ok(committed) => committed,
            Err(e) => {
                if let Err(restore) = self.ledger.restore_entry(saved, ttl).await {
                    warn!(step, error = %restore, "failed to restore history entry");
                }
                self.restore_current(Some(pre_state), ttl).await;
                return Err(e);
            }
        };

        if step + 1 < previous_total {
            match self.ledger.clear_range(step + 1, previous_total).await {
                Ok(()) => debug!(from = step + 1, to = previous_total, "discarded redo branch"),
                Err(e) => warn!(error = %e, "failed to discard redo branch"),
            }
        }
        if let Err(e) = self
            .ledger
            .cleanup_old(previous_start, total, config.max_history_entries)
            .await
        {
            warn!(error = %e, "failed to evict old history entries");
        }
        self.metadata.refresh_snapshot_ttls(&committed).await?;

        info!(
            user = %committed.user_id,
            dataset = %committed.dataset_id,
            step = committed.current_step,
            operation = %entry.operation_name,
            "transformation applied"
        );
        Ok(committed)
    }

    /// Step back one operation. `None` at the start of the retained history.
    pub async fn undo(&self, descriptor: SessionDescriptor) -> Result<Option<DataFrame>> {
        ensure_active(&descriptor, "undo")?;
        if !descriptor.can_undo() {
            debug!(step = descriptor.current_step, "nothing to undo");
            return Ok(None);
        }

        let step = descriptor.current_step - 1;
        let Some(bytes) = self.ledger.get_entry(step).await? else {
            warn!(step, "undo snapshot missing from the ledger");
            return Ok(None);
        };
        let frame = self.ctx.codec.decode_frame(&bytes)?;
        let ttl = descriptor.config().ttl();
        self.ctx
            .store
            .set(&self.ctx.keys.current(), &bytes, ttl)
            .await?;

        let next = SessionDescriptor {
            current_step: step,
            current_shape: frame.shape(),
            last_accessed: Utc::now(),
            ..descriptor
        };
        let committed = match self.metadata.store(next).await {
            Ok(committed) => committed,
            Err(e) => {
                let previous = self.ledger.get_redo(step).await.ok().flatten();
                self.restore_current(previous, ttl).await;
                return Err(e);
            }
        };
        self.metadata.refresh_snapshot_ttls(&committed).await?;

        info!(
            user = %committed.user_id,
            dataset = %committed.dataset_id,
            step = committed.current_step,
            "operation undone"
        );
        Ok(Some(frame))
    }

    /// Re-apply the next undone operation. `None` when there is none.
    pub async fn redo(&self, descriptor: SessionDescriptor) -> Result<Option<DataFrame>> {
        ensure_active(&descriptor, "redo")?;
        if !descriptor.can_redo() {
            debug!(step = descriptor.current_step, "nothing to redo");
            return Ok(None);
        }

        let step = descriptor.current_step;
        let Some(bytes) = self.ledger.get_redo(step).await? else {
            warn!(step, "redo snapshot missing from the ledger");
            return Ok(None);
        };
        let frame = self.ctx.codec.decode_frame(&bytes)?;
        let ttl = descriptor.config().ttl();
        self.ctx
            .store
            .set(&self.ctx.keys.current(), &bytes, ttl)
            .await?;

        let next = SessionDescriptor {
            current_step: step + 1,
            current_shape: frame.shape(),
            last_accessed: Utc::now(),
            ..descriptor
        };
        let committed = match self.metadata.store(next).await {
            Ok(committed) => committed,
            Err(e) => {
                let previous = self.ledger.get_entry(step).await.ok().flatten();
                self.restore_current(previous, ttl).await;
                return Err(e);
            }
        };
        self.metadata.refresh_snapshot_ttls(&committed).await?;

        info!(
            user = %committed.user_id,
            dataset = %committed.dataset_id,
            step = committed.current_step,
            "operation redone"
        );
        Ok(Some(frame))
    }

    async fn restore_current(&self, previous: Option<Vec<u8>>, ttl: Duration) {
        let key = self.ctx.keys.current();
        let Some(bytes) = previous else {
            warn!(key = %key, "no snapshot to restore after failed commit");
            return;
        };
        if let Err(e) = self.ctx.store.set(&key, &bytes, ttl).await {
            warn!(key = %key, error = %e, "failed to restore current snapshot");
        }
    }
}

pub(crate) fn ensure_active(descriptor: &SessionDescriptor, action: &str) -> Result<()> {
    if descriptor.is_active() {
        return Ok(());
    }
    Err(Error::InvalidState(format!(
        "cannot {action}: session {}/{} is {}",
        descriptor.user_id, descriptor.dataset_id, descriptor.status
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::Initializer;
    use dp_core::{Column, ColumnData, SessionConfig, SessionStatus};

    fn frame(values: &[i64]) -> DataFrame {
        DataFrame::new(vec![Column::new(
            "n",
            ColumnData::Int64(values.iter().copied().map(Some).collect()),
        )])
        .unwrap()
    }

    async fn setup(config: SessionConfig) -> (Transformer, MetadataManager, SessionContext) {
        let ctx = SessionContext::in_memory("test", "alice", "sales");
        Initializer::new(ctx.clone())
            .initialize(&frame(&[1, 2, 3]), false, config)
            .await
            .unwrap();
        (
            Transformer::new(ctx.clone()),
            MetadataManager::new(ctx.clone()),
            ctx,
        )
    }

    async fn descriptor(meta: &MetadataManager) -> SessionDescriptor {
        meta.get().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn apply_advances_counters_and_records_entry() {
        let (t, meta, ctx) = setup(SessionConfig::default()).await;
        let d = t
            .apply(descriptor(&meta).await, &frame(&[1, 2]), "filter", OperationParams::new())
            .await
            .unwrap();
        assert_eq!(d.current_step, 1);
        assert_eq!(d.total_operations, 1);
        assert_eq!(d.current_shape.rows, 2);

        let ledger = HistoryLedger::new(ctx.clone());
        let entry = ledger.get_entry_meta(0).await.unwrap().unwrap();
        assert_eq!(entry.operation_name, "filter");
        assert_eq!(entry.shape_before.rows, 3);
        assert_eq!(entry.shape_after.rows, 2);
    }

    #[tokio::test]
    async fn empty_operation_name_is_rejected() {
        let (t, meta, _) = setup(SessionConfig::default()).await;
        let err = t
            .apply(descriptor(&meta).await, &frame(&[1]), "  ", OperationParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(descriptor(&meta).await.current_step, 0);
    }

    #[tokio::test]
    async fn paused_session_rejects_mutation() {
        let (t, meta, _) = setup(SessionConfig::default()).await;
        let paused = meta
            .store(SessionDescriptor {
                status: SessionStatus::Paused,
                ..descriptor(&meta).await
            })
            .await
            .unwrap();
        let err = t.undo(paused).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn undo_and_redo_stop_at_the_boundaries() {
        let (t, meta, _) = setup(SessionConfig::default()).await;
        assert!(t.undo(descriptor(&meta).await).await.unwrap().is_none());
        assert!(t.redo(descriptor(&meta).await).await.unwrap().is_none());

        t.apply(descriptor(&meta).await, &frame(&[9]), "replace", OperationParams::new())
            .await
            .unwrap();
        let undone = t.undo(descriptor(&meta).await).await.unwrap().unwrap();
        assert_eq!(undone, frame(&[1, 2, 3]));
        let redone = t.redo(descriptor(&meta).await).await.unwrap().unwrap();
        assert_eq!(redone, frame(&[9]));
        assert!(t.redo(descriptor(&meta).await).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_moves_history_start() {
        let config = SessionConfig {
            max_history_entries: 2,
            ..SessionConfig::default()
        };
        let (t, meta, ctx) = setup(config).await;
        for i in 0..4 {
            t.apply(descriptor(&meta).await, &frame(&[i]), "step", OperationParams::new())
                .await
                .unwrap();
        }
        let d = descriptor(&meta).await;
        assert_eq!(d.history_start, 2);
        assert_eq!(d.history_len(), 2);
        let ledger = HistoryLedger::new(ctx);
        assert!(ledger.get_entry(1).await.unwrap().is_none());
        assert!(ledger.get_entry(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_commit_restores_current_snapshot() {
        let (t, meta, ctx) = setup(SessionConfig::default()).await;
        let stale = descriptor(&meta).await;
        meta.touch().await.unwrap();
        let before = ctx.store.get(&ctx.keys.current()).await.unwrap();

        let err = t
            .apply(stale, &frame(&[7]), "replace", OperationParams::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ctx.store.get(&ctx.keys.current()).await.unwrap(), before);
        for key in ctx.keys.entry_keys(0) {
            assert!(ctx.store.get(&key).await.unwrap().is_none(), "{key}");
        }
    }

    #[tokio::test]
    async fn failed_apply_keeps_the_redo_branch() {
        let (t, meta, _) = setup(SessionConfig::default()).await;
        t.apply(descriptor(&meta).await, &frame(&[1]), "replace", OperationParams::new())
            .await
            .unwrap();
        t.undo(descriptor(&meta).await).await.unwrap().unwrap();

        let stale = descriptor(&meta).await;
        meta.touch().await.unwrap();
        let err = t
            .apply(stale, &frame(&[999]), "overwrite", OperationParams::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let redone = t.redo(descriptor(&meta).await).await.unwrap().unwrap();
        assert_eq!(redone, frame(&[1]));
        let entry = HistoryLedger::new(t.ctx.clone())
            .get_entry_meta(0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.operation_name, "replace");
    }
}
