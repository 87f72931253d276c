//! In-process backend built on `DashMap`.

use super::{CacheBackend, Entries, TrackedNamespaces};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Slot {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Fields = Arc<DashMap<String, Slot>>;

/// In-memory backend for single-process deployments and tests.
///
/// TTL is tracked per field. Expired fields read as absent and are removed
/// lazily when touched. `replace` swaps the namespace map in one step, so
/// readers never see a half-replaced namespace.
///
/// # Example
///
/// ```
/// # use catalog_cache::backend::{CacheBackend, InMemoryBackend};
/// # async fn example() -> catalog_cache::Result<()> {
/// let backend = InMemoryBackend::new(["collections"]);
/// backend.set("collections", "C1-PROV", b"value".to_vec(), None).await?;
/// assert!(backend.get("collections", "C1-PROV").await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    namespaces: Arc<DashMap<String, Fields>>,
    tracked: TrackedNamespaces,
}

impl InMemoryBackend {
    /// Create a backend tracking the given namespaces.
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tracked = TrackedNamespaces::new(namespaces);
        info!(
            "✓ In-memory cache backend initialized ({} namespaces)",
            tracked.len()
        );
        InMemoryBackend {
            namespaces: Arc::new(DashMap::new()),
            tracked,
        }
    }

    fn fields(&self, namespace: &str) -> Fields {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    /// Number of live fields in a namespace, reserved fields included.
    pub fn len(&self, namespace: &str) -> usize {
        let now = Instant::now();
        self.namespaces
            .get(namespace)
            .map(|fields| fields.iter().filter(|s| !s.is_expired(now)).count())
            .unwrap_or(0)
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, namespace: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let Some(fields) = self.namespaces.get(namespace).map(|f| f.clone()) else {
            return Ok(None);
        };

        let now = Instant::now();
        let hit = fields.get(field).map(|slot| {
            if slot.is_expired(now) {
                None
            } else {
                Some(slot.value.clone())
            }
        });

        match hit {
            Some(Some(value)) => {
                debug!("✓ Memory GET {}/{} -> HIT", namespace, field);
                Ok(Some(value))
            }
            Some(None) => {
                fields.remove_if(field, |_, slot| slot.is_expired(now));
                debug!("✓ Memory GET {}/{} -> EXPIRED", namespace, field);
                Ok(None)
            }
            None => {
                debug!("✓ Memory GET {}/{} -> MISS", namespace, field);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        namespace: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.fields(namespace)
            .insert(field.to_string(), Slot::new(value, ttl));
        debug!("✓ Memory SET {}/{}", namespace, field);
        Ok(())
    }

    async fn set_bulk(
        &self,
        namespace: &str,
        entries: Entries,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let fields = self.fields(namespace);
        let count = entries.len();
        for (field, value) in entries {
            fields.insert(field, Slot::new(value, ttl));
        }
        debug!("✓ Memory SET_BULK {} ({} fields)", namespace, count);
        Ok(())
    }

    async fn replace(&self, namespace: &str, entries: Entries, ttl: Option<Duration>) -> Result<()> {
        let fresh: DashMap<String, Slot> = entries
            .into_iter()
            .map(|(field, value)| (field, Slot::new(value, ttl)))
            .collect();
        let count = fresh.len();
        self.namespaces
            .insert(namespace.to_string(), Arc::new(fresh));
        debug!("✓ Memory REPLACE {} ({} fields)", namespace, count);
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .namespaces
            .get(namespace)
            .map(|fields| {
                fields
                    .iter()
                    .filter(|slot| !slot.is_expired(now))
                    .map(|slot| slot.key().clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        self.namespaces.remove(namespace);
        debug!("✓ Memory CLEAR {}", namespace);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn tracked_namespaces(&self) -> &TrackedNamespaces {
        &self.tracked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend = InMemoryBackend::new(["a", "b"]);
        backend.set("a", "k", b"1".to_vec(), None).await.unwrap();

        assert_eq!(backend.get("a", "k").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("b", "k").await.unwrap(), None);
        assert_eq!(backend.len("a"), 1);
        assert_eq!(backend.len("b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let backend = InMemoryBackend::new(["a"]);
        backend
            .set("a", "k", b"v".to_vec(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        backend.set("a", "forever", b"v".to_vec(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(backend.get("a", "k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.get("a", "k").await.unwrap().is_none());
        assert_eq!(backend.keys("a").await.unwrap(), vec!["forever".to_string()]);
    }

    #[tokio::test]
    async fn test_replace_drops_old_fields() {
        let backend = InMemoryBackend::new(["a"]);
        backend
            .set_bulk(
                "a",
                vec![
                    ("old".to_string(), b"1".to_vec()),
                    ("kept".to_string(), b"1".to_vec()),
                ],
                None,
            )
            .await
            .unwrap();

        backend
            .replace("a", vec![("kept".to_string(), b"2".to_vec())], None)
            .await
            .unwrap();

        assert_eq!(backend.get("a", "old").await.unwrap(), None);
        assert_eq!(backend.get("a", "kept").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_reset_all_clears_tracked_namespaces() {
        let backend = InMemoryBackend::new(["a", "b"]);
        backend.set("a", "k", b"1".to_vec(), None).await.unwrap();
        backend.set("b", "k", b"1".to_vec(), None).await.unwrap();

        backend.reset_all().await.unwrap();

        assert_eq!(backend.len("a"), 0);
        assert_eq!(backend.len("b"), 0);
        assert!(backend.health_check().await.unwrap());
    }
}
