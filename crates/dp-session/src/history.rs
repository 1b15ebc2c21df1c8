//! History ledger: the bounded log behind undo and redo.
//!
//! Entry `n` records operation `n` (0-based) as three keys:
//!
//! - `history:{n}`: snapshot before the operation (undo target)
//! - `redo:{n}`: snapshot after the operation (redo target)
//! - `history:{n}:meta`: the [`HistoryEntry`] record
//!
//! Undo and redo both read from here, so eviction and branch discards apply
//! to them the same way.

use chrono::{DateTime, Utc};
use dp_core::{OperationParams, Result, Shape};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::{decode_record, encode_record};
use crate::context::SessionContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: u64,
    pub operation_name: String,
    #[serde(default)]
    pub operation_params: OperationParams,
    pub timestamp: DateTime<Utc>,
    pub shape_before: Shape,
    pub shape_after: Shape,
}

/// Raw contents of one entry's three keys, taken before the entry is
/// overwritten so a failed write can put them back.
#[derive(Debug)]
pub struct SavedEntry {
    step: u64,
    values: [Option<Vec<u8>>; 3],
}

impl SavedEntry {
    /// An entry that did not exist; restoring it deletes whatever was written.
    pub fn absent(step: u64) -> Self {
        Self {
            step,
            values: [None, None, None],
        }
    }
}

pub struct HistoryLedger {
    ctx: SessionContext,
}

impl HistoryLedger {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Record operation `entry.step` with its pre- and post-state snapshots.
    pub async fn add_entry(
        &self,
        entry: &HistoryEntry,
        pre_state: &[u8],
        post_state: &[u8],
        ttl: Duration,
    ) -> Result<()> {
        let keys = &self.ctx.keys;
        let record = encode_record(self.ctx.codec.as_ref(), entry)?;
        self.ctx
            .store
            .set(&keys.history(entry.step), pre_state, ttl)
            .await?;
        self.ctx
            .store
            .set(&keys.redo(entry.step), post_state, ttl)
            .await?;
        self.ctx
            .store
            .set(&keys.history_meta(entry.step), &record, ttl)
            .await?;
        debug!(
            step = entry.step,
            operation = %entry.operation_name,
            "history entry recorded"
        );
        Ok(())
    }

    /// Snapshot from before operation `step`.
    pub async fn get_entry(&self, step: u64) -> Result<Option<Vec<u8>>> {
        self.ctx.store.get(&self.ctx.keys.history(step)).await
    }

    /// Snapshot from after operation `step`.
    pub async fn get_redo(&self, step: u64) -> Result<Option<Vec<u8>>> {
        self.ctx.store.get(&self.ctx.keys.redo(step)).await
    }

    pub async fn get_entry_meta(&self, step: u64) -> Result<Option<HistoryEntry>> {
        let Some(raw) = self.ctx.store.get(&self.ctx.keys.history_meta(step)).await? else {
            return Ok(None);
        };
        decode_record(self.ctx.codec.as_ref(), &raw).map(Some)
    }

    /// Records of steps `[from, up_to)`, most recent first, at most `limit`.
    ///
    /// For display only. Missing or unreadable records are skipped.
    pub async fn get_summary(
        &self,
        from: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let mut summary = Vec::new();
        for step in (from..up_to).rev() {
            if summary.len() >= limit {
                break;
            }
            match self.get_entry_meta(step).await {
                Ok(Some(entry)) => summary.push(entry),
                Ok(None) => {}
                Err(e) if e.requires_clear() => {
                    warn!(step, error = %e, "skipping unreadable history record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Evict entries older than the newest `max_entries`.
    ///
    /// Deletes `[history_start, total_operations - max_entries)` and returns
    /// the new lowest retained step.
    pub async fn cleanup_old(
        &self,
        history_start: u64,
        total_operations: u64,
        max_entries: u64,
    ) -> Result<u64> {
        let floor = total_operations.saturating_sub(max_entries);
        if floor <= history_start {
            return Ok(history_start);
        }
        self.clear_range(history_start, floor).await?;
        debug!(from = history_start, to = floor, "evicted old history entries");
        Ok(floor)
    }

    pub async fn save_entry(&self, step: u64) -> Result<SavedEntry> {
        let mut saved = SavedEntry::absent(step);
        for (slot, key) in saved.values.iter_mut().zip(self.ctx.keys.entry_keys(step)) {
            *slot = self.ctx.store.get(&key).await?;
        }
        Ok(saved)
    }

    /// Put back the keys of a [`SavedEntry`]. Keys that were absent are
    /// deleted.
    pub async fn restore_entry(&self, saved: SavedEntry, ttl: Duration) -> Result<()> {
        let keys = self.ctx.keys.entry_keys(saved.step);
        for (key, value) in keys.iter().zip(saved.values) {
            match value {
                Some(bytes) => self.ctx.store.set(key, &bytes, ttl).await?,
                None => {
                    self.ctx.store.delete(key).await?;
                }
            }
        }
        Ok(())
    }

    /// Every key of entries `[from, to)`.
    pub fn range_keys(&self, from: u64, to: u64) -> Vec<String> {
        (from..to)
            .flat_map(|step| self.ctx.keys.entry_keys(step))
            .collect()
    }

    pub async fn clear_entry(&self, step: u64) -> Result<()> {
        self.ctx
            .store
            .delete_many(&self.ctx.keys.entry_keys(step))
            .await?;
        Ok(())
    }

    /// Drop entries `[from, to)`.
    pub async fn clear_range(&self, from: u64, to: u64) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        self.ctx
            .store
            .delete_many(&self.range_keys(from, to))
            .await?;
        Ok(())
    }

    /// Drop every ledger key of the session, including any left behind by
    /// an earlier session under the same ids.
    pub async fn clear_all(&self) -> Result<usize> {
        let prefix = self.ctx.keys.session_prefix();
        let mut keys = self
            .ctx
            .store
            .keys_with_prefix(&format!("{prefix}history:"))
            .await?;
        keys.extend(
            self.ctx
                .store
                .keys_with_prefix(&format!("{prefix}redo:"))
                .await?,
        );
        self.ctx.store.delete_many(&keys).await
    }
}
