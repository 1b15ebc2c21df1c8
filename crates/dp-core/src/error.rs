use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Only a lost race is worth retrying as-is. Everything else either
    /// needs different input or a cleared session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// A payload that failed to decode stays corrupt on every read; the
    /// session has to be cleared before it can be used again.
    pub fn requires_clear(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(Error::Conflict("v3 != v4".into()).is_retryable());
        assert!(!Error::Storage("down".into()).is_retryable());
        assert!(!Error::Serialization("bad".into()).is_retryable());
    }

    #[test]
    fn corrupt_payload_requires_clear() {
        assert!(Error::Serialization("bad envelope".into()).requires_clear());
        assert!(!Error::NotFound("current".into()).requires_clear());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::Expired("alice/sales".into());
        assert_eq!(err.to_string(), "Session expired: alice/sales");
    }
}
