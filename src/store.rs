//! Typed, namespace-scoped cache store - main entry point for cache reads.

use crate::backend::CacheBackend;
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::observability::{CacheMetrics, NoOpMetrics};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prefix of metadata fields that live beside the entities of a namespace.
pub const RESERVED_PREFIX: &str = "__";

/// True for metadata fields such as the refresh watermark.
pub fn is_reserved(field: &str) -> bool {
    field.starts_with(RESERVED_PREFIX)
}

fn meta_field(name: &str) -> String {
    format!("{}{}{}", RESERVED_PREFIX, name, RESERVED_PREFIX)
}

/// One namespace of a shared backend, holding values of type `T`.
///
/// Stores are cheap to clone and are passed explicitly to every component
/// that reads or writes the namespace.
///
/// # Example
///
/// ```ignore
/// use catalog_cache::{CacheStore, backend::InMemoryBackend};
///
/// let backend = InMemoryBackend::new(["collections"]);
/// let store: CacheStore<_, RevisionFormatMap> = CacheStore::new(backend, "collections")?
///     .with_ttl(Some(Duration::from_secs(26 * 3600)));
/// ```
pub struct CacheStore<B: CacheBackend, T: CacheEntity> {
    backend: B,
    namespace: Arc<str>,
    ttl: Option<Duration>,
    metrics: Arc<dyn CacheMetrics>,
    _entity: PhantomData<fn() -> T>,
}

impl<B: CacheBackend, T: CacheEntity> Clone for CacheStore<B, T> {
    fn clone(&self) -> Self {
        CacheStore {
            backend: self.backend.clone(),
            namespace: self.namespace.clone(),
            ttl: self.ttl,
            metrics: self.metrics.clone(),
            _entity: PhantomData,
        }
    }
}

impl<B: CacheBackend, T: CacheEntity> CacheStore<B, T> {
    /// Open a store over a namespace the backend tracks.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigError`: the backend was not constructed to track
    ///   `namespace`
    pub fn new(backend: B, namespace: &str) -> Result<Self> {
        if !backend.tracked_namespaces().contains(namespace) {
            return Err(Error::ConfigError(format!(
                "namespace {} is not tracked by the backend",
                namespace
            )));
        }

        Ok(CacheStore {
            backend,
            namespace: Arc::from(namespace),
            ttl: None,
            metrics: Arc::new(NoOpMetrics),
            _entity: PhantomData,
        })
    }

    /// Set the per-entry TTL. Must exceed the full refresh period of this
    /// namespace (see [`validate_namespace_ttl`](crate::jobs::validate_namespace_ttl)).
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub(crate) fn metrics(&self) -> &dyn CacheMetrics {
        self.metrics.as_ref()
    }

    /// Get backend reference (for advanced use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Cache-aside read.
    ///
    /// Returns the stored value if present. Otherwise runs `compute`, stores
    /// its result and returns it. Concurrent misses on the same field may
    /// each run `compute`; nothing serializes them.
    ///
    /// An entry that can no longer be decoded (schema change, corruption) is
    /// treated as a miss and overwritten. A computed value that cannot be
    /// stored (fails validation or serialization) is logged and still
    /// returned.
    ///
    /// # Errors
    ///
    /// - `Error::BackendError`: reading or writing back failed
    /// - whatever `compute` returns
    pub async fn get<F, Fut>(&self, field: &str, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timer = Instant::now();

        match self.read(field).await {
            Ok(Some(value)) => {
                self.metrics.record_hit(&self.namespace, timer.elapsed());
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) if e.is_systemic() => {
                self.metrics.record_error(&self.namespace, &e.to_string());
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Unreadable entry {}/{} treated as miss: {}",
                    self.namespace, field, e
                );
            }
        }

        debug!("Cache miss for {}/{}, computing", self.namespace, field);
        let value = compute().await?;

        match self.set(field, &value).await {
            Ok(()) => {}
            Err(e) if e.is_systemic() => {
                self.metrics.record_error(&self.namespace, &e.to_string());
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Failed to store computed value for {}/{}: {}",
                    self.namespace, field, e
                );
                self.metrics.record_error(&self.namespace, &e.to_string());
            }
        }

        self.metrics.record_miss(&self.namespace, timer.elapsed());
        Ok(value)
    }

    /// Plain read without fallback.
    pub async fn get_value(&self, field: &str) -> Result<Option<T>> {
        self.read(field).await
    }

    async fn read(&self, field: &str) -> Result<Option<T>> {
        match self.backend.get(&self.namespace, field).await? {
            Some(bytes) => {
                let value = T::deserialize_from_cache(&bytes)?;
                value.validate()?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Upsert one value.
    pub async fn set(&self, field: &str, value: &T) -> Result<()> {
        check_field(field)?;
        let bytes = value.serialize_for_cache()?;
        self.backend
            .set(&self.namespace, field, bytes, self.ttl)
            .await
    }

    /// Upsert many values. Every value is serialized before anything is
    /// written, so a serialization failure rejects the whole write.
    pub async fn set_bulk<I>(&self, values: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let entries = encode_all(values)?;
        let count = entries.len();
        self.backend
            .set_bulk(&self.namespace, entries, self.ttl)
            .await?;
        Ok(count)
    }

    /// Replace every entry of the namespace, metadata fields included.
    pub async fn replace_all<I>(&self, values: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let entries = encode_all(values)?;
        let count = entries.len();
        self.backend
            .replace(&self.namespace, entries, self.ttl)
            .await?;
        Ok(count)
    }

    /// Number of entity entries (metadata fields excluded).
    pub async fn size(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    /// Entity keys (metadata fields excluded).
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = self.backend.keys(&self.namespace).await?;
        keys.retain(|k| !is_reserved(k));
        Ok(keys)
    }

    /// Drop every entry, metadata included.
    pub async fn reset(&self) -> Result<()> {
        self.backend.clear(&self.namespace).await?;
        info!("✓ Cache {} reset", self.namespace);
        Ok(())
    }

    /// Read a metadata field.
    pub async fn get_meta(&self, name: &str) -> Result<Option<String>> {
        match self.backend.get(&self.namespace, &meta_field(name)).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Error::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    /// Write a metadata field. Metadata is written without a TTL of its own.
    pub async fn set_meta(&self, name: &str, value: &str) -> Result<()> {
        self.backend
            .set(
                &self.namespace,
                &meta_field(name),
                value.as_bytes().to_vec(),
                None,
            )
            .await
    }
}

fn check_field(field: &str) -> Result<()> {
    if field.is_empty() || is_reserved(field) {
        return Err(Error::ValidationError(format!(
            "{:?} is not a valid entry key",
            field
        )));
    }
    Ok(())
}

fn encode_all<T, I>(values: I) -> Result<Vec<(String, Vec<u8>)>>
where
    T: CacheEntity,
    I: IntoIterator<Item = (String, T)>,
{
    values
        .into_iter()
        .map(|(field, value)| {
            check_field(&field)?;
            Ok((field, value.serialize_for_cache()?))
        })
        .collect()
}
