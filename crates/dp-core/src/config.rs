//! Per-session configuration.
//!
//! The config travels inside every stored session descriptor, wrapped in a
//! schema-tagged [`ConfigRecord`] so that fields can be added later without
//! breaking descriptors written by an older build.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT_MINUTES: u64 = 240;
pub const DEFAULT_MAX_HISTORY_ENTRIES: u64 = 50;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which the session counts as expired. Also the TTL of
    /// every key written for the session.
    pub timeout_minutes: u64,
    /// Number of most recent operations that stay undoable.
    pub max_history_entries: u64,
    /// zlib level, 1 (fastest) to 9 (smallest).
    pub compression_level: u32,
    /// Purge an expired session's keys on the next existence check.
    pub cleanup_on_timeout: bool,
    /// Upper bound on the decompressed size of a single payload.
    pub max_payload_bytes: u64,
    /// Lifetime of the per-session write lease.
    pub lock_ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            max_history_entries: DEFAULT_MAX_HISTORY_ENTRIES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            cleanup_on_timeout: true,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_minutes == 0 {
            return Err(Error::Validation("timeout_minutes must be positive".into()));
        }
        if self.max_history_entries == 0 {
            return Err(Error::Validation(
                "max_history_entries must be positive".into(),
            ));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(Error::Validation(format!(
                "compression_level must be within 1..=9, got {}",
                self.compression_level
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(Error::Validation("max_payload_bytes must be positive".into()));
        }
        if self.lock_ttl_seconds == 0 {
            return Err(Error::Validation("lock_ttl_seconds must be positive".into()));
        }
        Ok(())
    }

    /// Idle timeout as a signed delta, for timestamp arithmetic.
    pub fn timeout(&self) -> TimeDelta {
        i64::try_from(self.timeout_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX)
    }

    /// TTL applied to every cache key of the session.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

/// Schema-tagged wrapper stored inside the session descriptor.
///
/// A new schema gets a new variant plus an arm in [`ConfigRecord::into_config`]
/// that upgrades it to the current [`SessionConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum ConfigRecord {
    #[serde(rename = "v1")]
    V1(SessionConfig),
}

impl ConfigRecord {
    pub fn current(config: SessionConfig) -> Self {
        Self::V1(config)
    }

    pub fn schema(&self) -> &'static str {
        match self {
            Self::V1(_) => "v1",
        }
    }

    pub fn config(&self) -> &SessionConfig {
        match self {
            Self::V1(config) => config,
        }
    }

    pub fn into_config(self) -> SessionConfig {
        match self {
            Self::V1(config) => config,
        }
    }
}

impl From<SessionConfig> for ConfigRecord {
    fn from(config: SessionConfig) -> Self {
        Self::current(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.timeout_minutes, 240);
        assert_eq!(config.max_history_entries, 50);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_compression() {
        for level in [0, 10] {
            let config = SessionConfig {
                compression_level: level,
                ..SessionConfig::default()
            };
            assert!(matches!(config.validate(), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn rejects_zero_history() {
        let config = SessionConfig {
            max_history_entries: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ttl_matches_timeout() {
        let config = SessionConfig {
            timeout_minutes: 2,
            ..SessionConfig::default()
        };
        assert_eq!(config.ttl(), Duration::from_secs(120));
        assert_eq!(config.timeout(), TimeDelta::minutes(2));
    }

    #[test]
    fn huge_timeout_saturates() {
        let config = SessionConfig {
            timeout_minutes: u64::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(config.timeout(), TimeDelta::MAX);
    }

    #[test]
    fn record_is_schema_tagged() {
        let record = ConfigRecord::current(SessionConfig::default());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["schema"], "v1");
        assert_eq!(json["timeout_minutes"], 240);
    }

    #[test]
    fn record_fills_missing_fields_with_defaults() {
        let json = serde_json::json!({ "schema": "v1", "timeout_minutes": 15 });
        let record: ConfigRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.schema(), "v1");
        let config = record.into_config();
        assert_eq!(config.timeout_minutes, 15);
        assert_eq!(config.max_history_entries, DEFAULT_MAX_HISTORY_ENTRIES);
    }

    #[test]
    fn record_rejects_unknown_schema() {
        let json = serde_json::json!({ "schema": "v99" });
        assert!(serde_json::from_value::<ConfigRecord>(json).is_err());
    }
}
