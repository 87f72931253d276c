//! Metrics hooks for cache reads and refresh cycles.
//!
//! Everything defaults to a no-op so callers only implement what they export.

use std::fmt;
use std::time::Duration;

/// Which refresh protocol produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshKind {
    Full,
    Incremental,
    /// Whole-namespace refresh of an auxiliary cache.
    Auxiliary,
    /// Single-entity refresh of an auxiliary cache.
    Single,
}

impl fmt::Display for RefreshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshKind::Full => write!(f, "full-refresh"),
            RefreshKind::Incremental => write!(f, "incremental-update"),
            RefreshKind::Auxiliary => write!(f, "refresh-entire-cache"),
            RefreshKind::Single => write!(f, "set-cache"),
        }
    }
}

/// Trait for recording cache metrics.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, _namespace: &str, _duration: Duration) {}

    /// Record a cache miss that went through the fallback.
    fn record_miss(&self, _namespace: &str, _duration: Duration) {}

    /// Record a failed read or write.
    fn record_error(&self, _namespace: &str, _error: &str) {}

    /// Record a completed refresh cycle.
    fn record_refresh(
        &self,
        _namespace: &str,
        _kind: RefreshKind,
        _entries: usize,
        _duration: Duration,
    ) {
    }

    /// Record a refresh cycle that aborted.
    fn record_refresh_failure(&self, _namespace: &str, _kind: RefreshKind, _error: &str) {}
}

/// Default no-op metrics implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_kind_names() {
        assert_eq!(RefreshKind::Full.to_string(), "full-refresh");
        assert_eq!(RefreshKind::Incremental.to_string(), "incremental-update");
        assert_eq!(RefreshKind::Auxiliary.to_string(), "refresh-entire-cache");
        assert_eq!(RefreshKind::Single.to_string(), "set-cache");
    }
}
