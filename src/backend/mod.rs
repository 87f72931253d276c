//! Namespace-scoped cache backends.
//!
//! A backend holds any number of namespaces, each a flat map of
//! field → bytes. It is constructed with the namespaces it tracks; stores
//! refuse to open untracked namespaces and [`CacheBackend::reset_all`] clears
//! exactly the tracked ones.

use crate::error::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "inmemory")]
mod inmemory;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBackend, RedisConfig};

/// Field/value pairs for bulk writes.
pub type Entries = Vec<(String, Vec<u8>)>;

/// Storage operations every backend provides.
///
/// Implementations must be cheap to clone (shared connection pool or shared
/// map behind an `Arc`).
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Clone + Send + Sync + 'static {
    /// Read one field. Expired fields read as `None`.
    async fn get(&self, namespace: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Upsert one field.
    async fn set(
        &self,
        namespace: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Upsert many fields. Each field is written whole; readers may see
    /// some of the fields before others.
    async fn set_bulk(&self, namespace: &str, entries: Entries, ttl: Option<Duration>)
        -> Result<()>;

    /// Replace every field of the namespace with `entries`.
    async fn replace(&self, namespace: &str, entries: Entries, ttl: Option<Duration>)
        -> Result<()>;

    /// Every live field of the namespace, reserved fields included.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    /// Drop every field of the namespace.
    async fn clear(&self, namespace: &str) -> Result<()>;

    async fn health_check(&self) -> Result<bool>;

    /// Namespaces this backend was constructed to track.
    fn tracked_namespaces(&self) -> &TrackedNamespaces;

    /// Clear every tracked namespace.
    async fn reset_all(&self) -> Result<()> {
        for namespace in self.tracked_namespaces().iter() {
            self.clear(namespace).await?;
        }
        warn!(
            "⚠ Cache reset for {} tracked namespaces",
            self.tracked_namespaces().len()
        );
        Ok(())
    }
}

/// Immutable set of namespace names a backend tracks.
#[derive(Debug, Clone, Default)]
pub struct TrackedNamespaces(Arc<BTreeSet<String>>);

impl TrackedNamespaces {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TrackedNamespaces(Arc::new(namespaces.into_iter().map(Into::into).collect()))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains(namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
