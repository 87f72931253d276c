//! Source query interfaces and in-memory implementations.
//!
//! The authoritative source (a search index, a database) is external. The
//! refresh protocols only need the three queries of [`CatalogRepository`];
//! the auxiliary caches need [`DataRepository`].

use crate::entity::CacheEntity;
use crate::error::Result;
use crate::format::EntityRecord;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Queries the metadata cache manager runs against the source.
///
/// Implementations report unreachable or failing sources as
/// `Error::SourceFetchError`.
#[allow(async_fn_in_trait)]
pub trait CatalogRepository: Send + Sync {
    /// Ids of every entity of `entity_type`.
    async fn fetch_all_ids(&self, entity_type: &str) -> Result<Vec<String>>;

    /// Ids of entities of `entity_type` changed at or after `since`.
    async fn fetch_changed_since(
        &self,
        entity_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Latest revision of each requested entity. Unknown ids are skipped.
    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<EntityRecord>>;
}

/// Trait for fetching entities of an auxiliary cache.
///
/// # Example
///
/// ```ignore
/// impl DataRepository<CollectionAcl> for AclRepository {
///     async fn fetch_by_id(&self, id: &String) -> Result<Option<CollectionAcl>> {
///         self.search.collection_acl(id).await
///     }
///
///     async fn fetch_all(&self) -> Result<Vec<CollectionAcl>> {
///         self.search.all_collection_acls().await
///     }
/// }
/// ```
#[allow(async_fn_in_trait)]
pub trait DataRepository<T: CacheEntity>: Send + Sync {
    /// Fetch a single entity by ID.
    ///
    /// Returns `Ok(None)` if the entity doesn't exist.
    async fn fetch_by_id(&self, id: &T::Key) -> Result<Option<T>>;

    /// Fetch every entity.
    async fn fetch_all(&self) -> Result<Vec<T>>;
}

/// In-memory catalog of a single entity type.
///
/// Cheap to clone; clones share the same records.
#[derive(Clone)]
pub struct InMemoryCatalog {
    entity_type: String,
    records: Arc<DashMap<String, EntityRecord>>,
}

impl InMemoryCatalog {
    pub fn new(entity_type: impl Into<String>) -> Self {
        InMemoryCatalog {
            entity_type: entity_type.into(),
            records: Arc::new(DashMap::new()),
        }
    }

    /// Insert or overwrite a record.
    pub fn insert(&self, record: EntityRecord) {
        self.records.insert(record.entity_id.clone(), record);
    }

    pub fn remove(&self, entity_id: &str) -> Option<EntityRecord> {
        self.records.remove(entity_id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sorted_ids(&self, filter: impl Fn(&EntityRecord) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| filter(r.value()))
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl CatalogRepository for InMemoryCatalog {
    async fn fetch_all_ids(&self, entity_type: &str) -> Result<Vec<String>> {
        if entity_type != self.entity_type {
            return Ok(Vec::new());
        }
        Ok(self.sorted_ids(|_| true))
    }

    async fn fetch_changed_since(
        &self,
        entity_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if entity_type != self.entity_type {
            return Ok(Vec::new());
        }
        Ok(self.sorted_ids(|r| r.revision_date >= since))
    }

    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<EntityRecord>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .collect())
    }
}

/// In-memory repository for auxiliary cache entities.
#[derive(Clone)]
pub struct InMemoryRepository<T: CacheEntity> {
    data: Arc<DashMap<T::Key, T>>,
}

impl<T: CacheEntity> InMemoryRepository<T> {
    pub fn new() -> Self {
        InMemoryRepository {
            data: Arc::new(DashMap::new()),
        }
    }

    /// Insert or overwrite an entity under its cache key.
    pub fn insert(&self, entity: T) {
        self.data.insert(entity.cache_key(), entity);
    }

    pub fn remove(&self, id: &T::Key) -> Option<T> {
        self.data.remove(id).map(|(_, entity)| entity)
    }
}

impl<T: CacheEntity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheEntity> DataRepository<T> for InMemoryRepository<T> {
    async fn fetch_by_id(&self, id: &T::Key) -> Result<Option<T>> {
        Ok(self.data.get(id).map(|e| e.value().clone()))
    }

    async fn fetch_all(&self) -> Result<Vec<T>> {
        Ok(self.data.iter().map(|e| e.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatId;
    use chrono::TimeZone;

    fn record(id: &str, day: u32) -> EntityRecord {
        EntityRecord {
            entity_id: id.to_string(),
            revision_id: 1,
            native_format: FormatId::simple("echo10"),
            payload: format!("<Collection id=\"{}\"/>", id),
            revision_date: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_catalog_queries() {
        let catalog = InMemoryCatalog::new("collection");
        catalog.insert(record("C2-PROV", 2));
        catalog.insert(record("C1-PROV", 1));
        catalog.insert(record("C3-PROV", 3));

        assert_eq!(
            catalog.fetch_all_ids("collection").await.unwrap(),
            vec!["C1-PROV", "C2-PROV", "C3-PROV"]
        );
        assert!(catalog.fetch_all_ids("granule").await.unwrap().is_empty());

        let since = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(
            catalog
                .fetch_changed_since("collection", since)
                .await
                .unwrap(),
            vec!["C2-PROV", "C3-PROV"]
        );

        let records = catalog
            .fetch_records(&["C3-PROV".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id, "C3-PROV");
    }
}
