//! Redis backend: one hash per namespace.

use super::{CacheBackend, Entries, TrackedNamespaces};
use crate::config::CacheSettings;
use crate::error::{Error, Result};
use ::redis::AsyncCommands;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use std::time::Duration;

/// Default Redis connection pool size.
/// Override with CATALOG_CACHE_REDIS_POOL_SIZE (see [`RedisBackend::from_settings`])
const DEFAULT_POOL_SIZE: usize = 16;

/// Fields written per HSET while staging a full replacement.
const REPLACE_CHUNK: usize = 500;

/// Configuration for the Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g., "redis://localhost:6379/0"
    pub pool_size: usize,
    /// Prepended to every namespace to form the Redis key.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://localhost:6379".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    /// Connection settings from `CATALOG_CACHE_REDIS_URL` and
    /// `CATALOG_CACHE_REDIS_POOL_SIZE`, falling back to the defaults.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let defaults = RedisConfig::default();
        RedisConfig {
            url: settings.redis_url.clone().unwrap_or(defaults.url),
            pool_size: settings.redis_pool_size.unwrap_or(defaults.pool_size),
            ..defaults
        }
    }
}

/// Redis backend with connection pooling.
///
/// Each namespace is a Redis hash. Redis expires whole keys, not hash
/// fields, so a configured TTL is (re)applied to the namespace hash on every
/// write: the namespace as a whole expires once writes stop arriving.
///
/// `replace` builds the new hash under a staging key and `RENAME`s it over
/// the live key, so readers switch from the old to the new contents at once.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    key_prefix: String,
    tracked: TrackedNamespaces,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub fn new<I, S>(config: RedisConfig, namespaces: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pool_config = Config::from_url(config.url.clone());
        pool_config.pool = Some(PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))?;

        let tracked = TrackedNamespaces::new(namespaces);
        info!(
            "✓ Redis backend initialized with {} (pool size: {}, {} namespaces)",
            config.url,
            config.pool_size,
            tracked.len()
        );

        Ok(RedisBackend {
            pool,
            key_prefix: config.key_prefix,
            tracked,
        })
    }

    /// Backend for the namespaces of `settings`, connecting as configured
    /// there.
    ///
    /// Uses (in order of precedence):
    /// 1. `CATALOG_CACHE_REDIS_URL` / `CATALOG_CACHE_REDIS_POOL_SIZE` (if set)
    /// 2. `redis://localhost:6379` and `DEFAULT_POOL_SIZE` (16)
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        Self::new(RedisConfig::from_settings(settings), settings.namespaces())
    }

    fn key(&self, namespace: &str) -> String {
        format!("{}{}", self.key_prefix, namespace)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

impl CacheBackend for RedisBackend {
    async fn get(&self, namespace: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.hget(self.key(namespace), field).await?;
        debug!(
            "✓ Redis HGET {}/{} -> {}",
            namespace,
            field,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(
        &self,
        namespace: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.key(namespace);
        let mut conn = self.connection().await?;

        let mut pipe = ::redis::pipe();
        pipe.atomic().hset(&key, field, value).ignore();
        if let Some(ttl) = ttl {
            pipe.expire(&key, ttl_secs(ttl)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        debug!("✓ Redis HSET {}/{}", namespace, field);
        Ok(())
    }

    async fn set_bulk(
        &self,
        namespace: &str,
        entries: Entries,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let key = self.key(namespace);
        let mut conn = self.connection().await?;

        let mut pipe = ::redis::pipe();
        pipe.atomic().hset_multiple(&key, &entries).ignore();
        if let Some(ttl) = ttl {
            pipe.expire(&key, ttl_secs(ttl)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        debug!("✓ Redis HSET {} ({} fields)", namespace, entries.len());
        Ok(())
    }

    async fn replace(&self, namespace: &str, entries: Entries, ttl: Option<Duration>) -> Result<()> {
        let key = self.key(namespace);
        let mut conn = self.connection().await?;

        if entries.is_empty() {
            conn.del::<_, ()>(&key).await?;
            debug!("✓ Redis REPLACE {} (empty)", namespace);
            return Ok(());
        }

        let staging = format!("{}:staging", key);
        conn.del::<_, ()>(&staging).await?;
        for chunk in entries.chunks(REPLACE_CHUNK) {
            conn.hset_multiple::<_, _, _, ()>(&staging, chunk).await?;
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic().rename(&staging, &key).ignore();
        if let Some(ttl) = ttl {
            pipe.expire(&key, ttl_secs(ttl)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        debug!("✓ Redis REPLACE {} ({} fields)", namespace, entries.len());
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn.hkeys(self.key(namespace)).await?;
        Ok(keys)
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.key(namespace)).await?;
        debug!("✓ Redis DEL {}", namespace);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => {
                let pong: std::result::Result<String, _> =
                    ::redis::cmd("PING").query_async(&mut conn).await;
                Ok(pong.is_ok())
            }
            Err(_) => Ok(false),
        }
    }

    fn tracked_namespaces(&self) -> &TrackedNamespaces {
        &self.tracked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert!(config.key_prefix.is_empty());
    }

    #[test]
    fn test_redis_config_from_settings() {
        let settings = CacheSettings {
            redis_url: Some("redis://cache:6380/2".to_string()),
            redis_pool_size: Some(4),
            ..Default::default()
        };
        let config = RedisConfig::from_settings(&settings);
        assert_eq!(config.url, "redis://cache:6380/2");
        assert_eq!(config.pool_size, 4);

        let config = RedisConfig::from_settings(&CacheSettings::default());
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_backend_from_settings_tracks_both_caches() {
        let settings = CacheSettings::default();
        let backend = RedisBackend::from_settings(&settings).expect("Failed to create pool");
        assert!(backend
            .tracked_namespaces()
            .contains(&settings.metadata_namespace));
        assert!(backend.tracked_namespaces().contains(&settings.acl_namespace));
    }

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(900)), 900);
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let backend = RedisBackend::new(
            RedisConfig {
                key_prefix: "cmr:".to_string(),
                ..Default::default()
            },
            ["collections"],
        )
        .expect("Failed to create pool");

        assert_eq!(backend.key("collections"), "cmr:collections");
        assert!(backend.tracked_namespaces().contains("collections"));
    }
}
