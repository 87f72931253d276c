//! Error types for cache operations and refresh cycles.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the cache stores, the builder and the refresh protocols.
///
/// Per-item failures (`TransformError`) are contained by the builder at the
/// smallest scope possible. Systemic failures (`SourceFetchError`,
/// `BackendError`) always reach the caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The authoritative source could not be queried.
    #[error("source fetch failed: {0}")]
    SourceFetchError(String),

    /// Rendering one entity (or one of its formats) failed.
    #[error("transform failed: {0}")]
    TransformError(String),

    /// The cache backend is unavailable or rejected the command.
    #[error("cache backend error: {0}")]
    BackendError(String),

    /// A value could not be converted into a storable form.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Stored bytes could not be decoded back into a value.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Stored bytes are not framed as a cache entry.
    #[error("invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Stored entry was written with another schema version.
    #[error("cache schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

impl Error {
    /// True for failures that should abort a refresh cycle.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Error::SourceFetchError(_) | Error::BackendError(_))
    }
}

impl serde::ser::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::SerializationError(msg.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemic_classification() {
        assert!(Error::SourceFetchError("down".into()).is_systemic());
        assert!(Error::BackendError("refused".into()).is_systemic());
        assert!(!Error::TransformError("bad xml".into()).is_systemic());
        assert!(!Error::SerializationError("nan".into()).is_systemic());
    }

    #[test]
    fn test_version_mismatch_display() {
        let err = Error::VersionMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "cache schema version mismatch: expected 2, found 1"
        );
    }
}
