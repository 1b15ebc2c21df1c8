use std::sync::Arc;

use crate::codec::{JsonCodec, SnapshotCodec};
use crate::store::{CacheStore, MemoryStore, SessionKeys};

/// Collaborators shared by every component of one session: the store, the
/// codec, and the key layout. Cloning is cheap.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn CacheStore>,
    pub codec: Arc<dyn SnapshotCodec>,
    pub keys: SessionKeys,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn CacheStore>,
        codec: Arc<dyn SnapshotCodec>,
        keys: SessionKeys,
    ) -> Self {
        Self { store, codec, keys }
    }

    /// Fresh [`MemoryStore`] with the default codec.
    pub fn in_memory(scope: &str, user_id: &str, dataset_id: &str) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(JsonCodec::default()),
            SessionKeys::new(scope, user_id, dataset_id),
        )
    }
}
