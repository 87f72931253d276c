//! Deployment settings, read from `CATALOG_CACHE_*` environment variables.

use crate::builder::{FormatTransformer, RevisionFormatMapBuilder};
use crate::error::{Error, Result};
use crate::format::{CachedFormatsConfig, FormatId};
use crate::jobs::{default_jobs, validate_namespace_ttl};
use crate::manager::{CacheManagerConfig, DEFAULT_BATCH_SIZE};
use chrono::NaiveTime;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "CATALOG_CACHE_";

/// Settings for the metadata and access-control caches.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub entity_type: String,
    pub metadata_namespace: String,
    pub acl_namespace: String,
    pub batch_size: usize,
    pub excluded_formats: Vec<FormatId>,
    pub tolerate_entity_failures: bool,
    /// Rayon workers for format rendering; the global pool when unset.
    pub builder_threads: Option<usize>,
    pub metadata_ttl: Option<Duration>,
    pub acl_ttl: Option<Duration>,
    /// UTC time of day of the daily full refresh.
    pub full_refresh_at: NaiveTime,
    pub incremental_interval: Duration,
    pub acl_refresh_interval: Duration,
    pub redis_url: Option<String>,
    pub redis_pool_size: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            entity_type: "collection".to_string(),
            metadata_namespace: "collection-metadata-cache".to_string(),
            acl_namespace: "collection-acl-cache".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            excluded_formats: Vec::new(),
            tolerate_entity_failures: false,
            builder_threads: None,
            metadata_ttl: Some(Duration::from_secs(26 * 60 * 60)),
            acl_ttl: Some(Duration::from_secs(15 * 60)),
            full_refresh_at: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            incremental_interval: Duration::from_secs(15 * 60),
            acl_refresh_interval: Duration::from_secs(5 * 60),
            redis_url: None,
            redis_pool_size: None,
        }
    }
}

impl CacheSettings {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by `lookup`, which receives full variable names
    /// such as `CATALOG_CACHE_BATCH_SIZE`.
    ///
    /// Durations are whole seconds; a TTL of `0` disables expiry. Excluded
    /// formats are comma separated `tag` / `tag@version` ids.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = CacheSettings::default();

        if let Some(v) = get("ENTITY_TYPE") {
            settings.entity_type = v;
        }
        if let Some(v) = get("METADATA_NAMESPACE") {
            settings.metadata_namespace = v;
        }
        if let Some(v) = get("ACL_NAMESPACE") {
            settings.acl_namespace = v;
        }
        if let Some(v) = get("BATCH_SIZE") {
            settings.batch_size = parse("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("EXCLUDED_FORMATS") {
            settings.excluded_formats = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(FormatId::from_str)
                .collect::<Result<_>>()?;
        }
        if let Some(v) = get("TOLERATE_ENTITY_FAILURES") {
            settings.tolerate_entity_failures = parse("TOLERATE_ENTITY_FAILURES", &v)?;
        }
        if let Some(v) = get("BUILDER_THREADS") {
            settings.builder_threads = Some(parse("BUILDER_THREADS", &v)?);
        }
        if let Some(v) = get("METADATA_TTL_SECS") {
            settings.metadata_ttl = ttl("METADATA_TTL_SECS", &v)?;
        }
        if let Some(v) = get("ACL_TTL_SECS") {
            settings.acl_ttl = ttl("ACL_TTL_SECS", &v)?;
        }
        if let Some(v) = get("FULL_REFRESH_AT") {
            settings.full_refresh_at = NaiveTime::parse_from_str(&v, "%H:%M").map_err(|e| {
                Error::ConfigError(format!("FULL_REFRESH_AT {:?}: {}", v, e))
            })?;
        }
        if let Some(v) = get("INCREMENTAL_INTERVAL_SECS") {
            settings.incremental_interval =
                Duration::from_secs(parse("INCREMENTAL_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("ACL_REFRESH_INTERVAL_SECS") {
            settings.acl_refresh_interval =
                Duration::from_secs(parse("ACL_REFRESH_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("REDIS_URL") {
            settings.redis_url = Some(v);
        }
        if let Some(v) = get("REDIS_POOL_SIZE") {
            settings.redis_pool_size = Some(parse("REDIS_POOL_SIZE", &v)?);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Check internal consistency, including TTLs against the default jobs.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::ConfigError("batch size must be positive".to_string()));
        }
        if self.builder_threads == Some(0) {
            return Err(Error::ConfigError(
                "builder threads must be positive".to_string(),
            ));
        }
        if self.redis_pool_size == Some(0) {
            return Err(Error::ConfigError(
                "Redis pool size must be positive".to_string(),
            ));
        }
        if self.metadata_namespace == self.acl_namespace {
            return Err(Error::ConfigError(format!(
                "metadata and ACL caches share namespace {}",
                self.metadata_namespace
            )));
        }
        if self.incremental_interval.is_zero() || self.acl_refresh_interval.is_zero() {
            return Err(Error::ConfigError(
                "refresh intervals must be positive".to_string(),
            ));
        }

        let jobs = default_jobs(self);
        validate_namespace_ttl(&jobs, &self.metadata_namespace, self.metadata_ttl)?;
        validate_namespace_ttl(&jobs, &self.acl_namespace, self.acl_ttl)?;
        Ok(())
    }

    /// Namespaces a backend must track for these settings.
    pub fn namespaces(&self) -> [&str; 2] {
        [&self.metadata_namespace, &self.acl_namespace]
    }

    /// Format builder over `transformer`, on a dedicated pool of
    /// `builder_threads` workers when set.
    pub fn format_builder(
        &self,
        transformer: Arc<dyn FormatTransformer>,
    ) -> Result<RevisionFormatMapBuilder> {
        let builder = RevisionFormatMapBuilder::new(transformer);
        match self.builder_threads {
            Some(threads) => builder.with_parallelism(threads),
            None => Ok(builder),
        }
    }

    /// Manager configuration caching `all_formats` minus the excluded ones.
    pub fn manager_config(
        &self,
        all_formats: impl IntoIterator<Item = FormatId>,
    ) -> CacheManagerConfig {
        CacheManagerConfig {
            entity_type: self.entity_type.clone(),
            batch_size: self.batch_size,
            tolerate_entity_failures: self.tolerate_entity_failures,
            cached_formats: CachedFormatsConfig::new(all_formats)
                .with_excluded(self.excluded_formats.iter().cloned()),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::ConfigError(format!("{}{} {:?}: {}", ENV_PREFIX, key, value, e)))
}

fn ttl(key: &str, value: &str) -> Result<Option<Duration>> {
    let secs: u64 = parse(key, value)?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RenderedFormats;
    use crate::format::EntityRecord;
    use std::collections::{BTreeSet, HashMap};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = CacheSettings::from_lookup(lookup(&[])).expect("defaults");
        assert_eq!(settings, CacheSettings::default());
        assert_eq!(settings.batch_size, 1000);
    }

    #[test]
    fn test_overrides() {
        let settings = CacheSettings::from_lookup(lookup(&[
            ("CATALOG_CACHE_BATCH_SIZE", "250"),
            ("CATALOG_CACHE_EXCLUDED_FORMATS", "iso19115, umm-json@1.17.3,"),
            ("CATALOG_CACHE_FULL_REFRESH_AT", "03:30"),
            ("CATALOG_CACHE_ACL_TTL_SECS", "0"),
            ("CATALOG_CACHE_REDIS_URL", "redis://cache:6379"),
        ]))
        .expect("settings");

        assert_eq!(settings.batch_size, 250);
        assert_eq!(
            settings.excluded_formats,
            vec![
                FormatId::simple("iso19115"),
                FormatId::versioned("umm-json", "1.17.3")
            ]
        );
        assert_eq!(
            settings.full_refresh_at,
            NaiveTime::from_hms_opt(3, 30, 0).unwrap()
        );
        assert_eq!(settings.acl_ttl, None);
        assert_eq!(settings.redis_url.as_deref(), Some("redis://cache:6379"));

        let config = settings.manager_config([
            FormatId::simple("echo10"),
            FormatId::simple("iso19115"),
        ]);
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.cached_formats.cached_formats().len(), 1);
    }

    #[test]
    fn test_format_builder_uses_configured_threads() {
        let transformer: Arc<dyn FormatTransformer> = Arc::new(
            |_: &EntityRecord, _: &BTreeSet<FormatId>| -> Result<RenderedFormats> {
                Ok(RenderedFormats::new())
            },
        );

        let settings =
            CacheSettings::from_lookup(lookup(&[("CATALOG_CACHE_BUILDER_THREADS", "2")]))
                .expect("settings");
        let builder = settings
            .format_builder(transformer.clone())
            .expect("builder");
        assert_eq!(builder.parallelism(), Some(2));

        let builder = CacheSettings::default()
            .format_builder(transformer)
            .expect("builder");
        assert_eq!(builder.parallelism(), None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("CATALOG_CACHE_BATCH_SIZE", "0")],
            [("CATALOG_CACHE_BATCH_SIZE", "many")],
            [("CATALOG_CACHE_EXCLUDED_FORMATS", "@1.0")],
            [("CATALOG_CACHE_FULL_REFRESH_AT", "6am")],
            // Shorter than the daily full refresh.
            [("CATALOG_CACHE_METADATA_TTL_SECS", "3600")],
            [("CATALOG_CACHE_ACL_NAMESPACE", "collection-metadata-cache")],
            [("CATALOG_CACHE_REDIS_POOL_SIZE", "0")],
        ] {
            assert!(
                CacheSettings::from_lookup(lookup(&vars)).is_err(),
                "{:?} should be rejected",
                vars
            );
        }
    }
}
