pub mod codec;
pub mod context;
pub mod history;
pub mod initializer;
pub mod lease;
pub mod lifecycle;
pub mod metadata;
pub mod orchestrator;
pub mod store;
pub mod transformer;

pub use codec::{JsonCodec, Metadata, SnapshotCodec};
pub use context::SessionContext;
pub use history::{HistoryEntry, HistoryLedger, SavedEntry};
pub use initializer::{list_sessions, sweep_expired, Initializer};
pub use lease::SessionLease;
pub use lifecycle::Lifecycle;
pub use metadata::{MetadataManager, SessionDescriptor};
pub use orchestrator::{SessionDetails, SessionInfo, TransformSession};
pub use store::{CacheStore, MemoryStore, SessionKeys};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use transformer::Transformer;
