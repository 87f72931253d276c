//! Core entity trait that all cached values must implement.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;

/// Trait that all values stored in a cache namespace must implement.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use catalog_cache::CacheEntity;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct Tag {
///     pub key: String,
///     pub description: String,
/// }
///
/// impl CacheEntity for Tag {
///     type Key = String;
///
///     fn cache_key(&self) -> Self::Key {
///         self.key.clone()
///     }
/// }
/// ```
pub trait CacheEntity: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone {
    /// Type of the entity's key/ID (typically the concept id string)
    type Key: Display + Clone + Send + Sync + Eq + Hash + 'static;

    /// Return the entity's unique key within its namespace.
    fn cache_key(&self) -> Self::Key;

    /// Serialize entity for cache storage.
    ///
    /// Defaults to the versioned postcard envelope in `crate::serialization`.
    /// Entities holding values the backend cannot store natively override
    /// this with the storability adapter (see `crate::adapter`).
    fn serialize_for_cache(&self) -> Result<Vec<u8>> {
        crate::serialization::serialize_for_cache(self)
    }

    /// Deserialize entity from cache storage.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCacheEntry`: Bad magic or corrupted envelope
    /// - `Error::VersionMismatch`: Schema version changed
    /// - `Error::DeserializationError`: Corrupted payload
    fn deserialize_from_cache(bytes: &[u8]) -> Result<Self> {
        crate::serialization::deserialize_from_cache(bytes)
    }

    /// Optional: Validate entity after deserialization.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Clone, Serialize, Deserialize)]
    struct TestEntity {
        id: String,
        value: String,
    }

    impl CacheEntity for TestEntity {
        type Key = String;

        fn cache_key(&self) -> Self::Key {
            self.id.clone()
        }

        fn validate(&self) -> Result<()> {
            if self.value.is_empty() {
                return Err(Error::ValidationError("empty value".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_serialize_deserialize() {
        let entity = TestEntity {
            id: "test_1".to_string(),
            value: "data".to_string(),
        };

        let bytes = entity.serialize_for_cache().unwrap();
        let deserialized = TestEntity::deserialize_from_cache(&bytes).unwrap();

        assert_eq!(entity.id, deserialized.id);
        assert_eq!(entity.value, deserialized.value);
    }

    #[test]
    fn test_validate_hook() {
        let entity = TestEntity {
            id: "test_2".to_string(),
            value: String::new(),
        };
        assert!(entity.validate().is_err());
        assert_eq!(entity.cache_key(), "test_2");
    }
}
