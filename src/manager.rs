//! Refresh protocols of the multi-format metadata cache.
//!
//! Two cycles keep a namespace of [`RevisionFormatMap`]s in sync with the
//! catalog:
//!
//! - **full refresh** rebuilds every entity and replaces the namespace. It is
//!   the only cycle that drops deleted entities and applies a changed format
//!   configuration to unchanged entities.
//! - **incremental update** rebuilds entities changed since the stored
//!   watermark and merges them in.
//!
//! The watermark is the clock reading taken *before* the source is queried
//! and is only stored once every write of the cycle succeeded. An entity
//! changed while a cycle is fetching is therefore seen again by the next
//! cycle instead of being skipped.

use crate::adapter::{canonical_timestamp, parse_timestamp};
use crate::backend::CacheBackend;
use crate::builder::RevisionFormatMapBuilder;
use crate::error::{Error, Result};
use crate::format::{CachedFormatsConfig, EntityRecord, FormatId, RevisionFormatMap};
use crate::jobs::RefreshTarget;
use crate::observability::RefreshKind;
use crate::repository::CatalogRepository;
use crate::store::CacheStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// Metadata field holding the refresh watermark.
pub const WATERMARK_FIELD: &str = "last_updated";

/// Default number of entities fetched and built per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Configuration of a [`MetadataCacheManager`].
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// Entity type passed to the source queries.
    pub entity_type: String,
    pub batch_size: usize,
    /// Keep refreshing when whole entities fail to render, leaving them out
    /// of the cache. Off by default: any such failure aborts the cycle.
    pub tolerate_entity_failures: bool,
    pub cached_formats: CachedFormatsConfig,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        CacheManagerConfig {
            entity_type: "collection".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            tolerate_entity_failures: false,
            cached_formats: CachedFormatsConfig::default(),
        }
    }
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub kind: RefreshKind,
    pub batches: usize,
    pub entries_written: usize,
    /// Entity entries in the namespace after the cycle.
    pub cache_size: usize,
    /// Watermark stored by the cycle, if it keeps one.
    pub watermark: Option<DateTime<Utc>>,
    /// Entities left out because they could not be rendered.
    pub failed_entities: Vec<String>,
}

/// What happened to a triggered cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another cycle was already running on this cache.
    Skipped,
}

impl RefreshOutcome {
    pub fn report(&self) -> Option<&RefreshReport> {
        match self {
            RefreshOutcome::Completed(report) => Some(report),
            RefreshOutcome::Skipped => None,
        }
    }
}

struct BuiltBatches {
    maps: Vec<RevisionFormatMap>,
    batches: usize,
    failed_entities: Vec<String>,
}

/// Keeps one namespace of revision format maps synchronized with a catalog.
///
/// At most one cycle runs at a time per manager: a trigger arriving while a
/// cycle is in flight is skipped and reported as [`RefreshOutcome::Skipped`].
pub struct MetadataCacheManager<B: CacheBackend, R: CatalogRepository> {
    store: CacheStore<B, RevisionFormatMap>,
    repository: Arc<R>,
    builder: RevisionFormatMapBuilder,
    entity_type: String,
    batch_size: usize,
    tolerate_entity_failures: bool,
    formats: RwLock<CachedFormatsConfig>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<()>,
}

impl<B: CacheBackend, R: CatalogRepository> MetadataCacheManager<B, R> {
    /// # Errors
    ///
    /// - `Error::ConfigError`: batch size of zero
    pub fn new(
        store: CacheStore<B, RevisionFormatMap>,
        repository: Arc<R>,
        builder: RevisionFormatMapBuilder,
        config: CacheManagerConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::ConfigError("batch size must be positive".to_string()));
        }

        Ok(MetadataCacheManager {
            store,
            repository,
            builder,
            entity_type: config.entity_type,
            batch_size: config.batch_size,
            tolerate_entity_failures: config.tolerate_entity_failures,
            formats: RwLock::new(config.cached_formats),
            clock: Arc::new(SystemClock),
            in_flight: Mutex::new(()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &CacheStore<B, RevisionFormatMap> {
        &self.store
    }

    /// Formats the next cycle will build.
    pub async fn cached_formats(&self) -> BTreeSet<FormatId> {
        self.formats.read().await.cached_formats()
    }

    /// Replace the excluded format set. Incremental updates apply it to the
    /// entities they rebuild; the next full refresh applies it everywhere.
    pub async fn set_excluded_formats(&self, excluded: impl IntoIterator<Item = FormatId>) {
        let mut formats = self.formats.write().await;
        *formats = formats.clone().with_excluded(excluded);
        info!(
            "Cached formats for {} now exclude {:?}",
            self.store.namespace(),
            formats.excluded()
        );
    }

    /// Watermark stored by the last successful cycle.
    pub async fn last_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        self.store
            .get_meta(WATERMARK_FIELD)
            .await?
            .map(|text| parse_timestamp(&text))
            .transpose()
    }

    /// Run the cycle a scheduled job asks for.
    pub async fn run(&self, target: RefreshTarget) -> Result<RefreshOutcome> {
        match target {
            RefreshTarget::Full => self.full_refresh().await,
            RefreshTarget::Incremental => self.incremental_update().await,
        }
    }

    /// Rebuild every entity and replace the namespace.
    pub async fn full_refresh(&self) -> Result<RefreshOutcome> {
        self.single_flight(RefreshKind::Full, self.run_full()).await
    }

    /// Rebuild entities changed since the stored watermark and merge them
    /// into the namespace. Without a stored watermark this runs a full
    /// refresh instead.
    pub async fn incremental_update(&self) -> Result<RefreshOutcome> {
        self.single_flight(RefreshKind::Incremental, self.run_incremental())
            .await
    }

    async fn single_flight<F>(&self, kind: RefreshKind, cycle: F) -> Result<RefreshOutcome>
    where
        F: Future<Output = Result<RefreshReport>>,
    {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!(
                "Skipping {} of {}: another cycle is running",
                kind,
                self.store.namespace()
            );
            return Ok(RefreshOutcome::Skipped);
        };

        let timer = Instant::now();
        let metrics = self.store.metrics();
        match cycle.await {
            Ok(report) => {
                info!(
                    "✓ {} of {} finished in {:?}: {} entries written, cache size {}",
                    report.kind,
                    self.store.namespace(),
                    timer.elapsed(),
                    report.entries_written,
                    report.cache_size
                );
                metrics.record_refresh(
                    self.store.namespace(),
                    report.kind,
                    report.entries_written,
                    timer.elapsed(),
                );
                Ok(RefreshOutcome::Completed(report))
            }
            Err(e) => {
                error!("✗ {} of {} failed: {}", kind, self.store.namespace(), e);
                metrics.record_refresh_failure(self.store.namespace(), kind, &e.to_string());
                Err(e)
            }
        }
    }

    async fn run_full(&self) -> Result<RefreshReport> {
        let started = self.clock.now();
        let ids = self.repository.fetch_all_ids(&self.entity_type).await?;
        debug!(
            "Full refresh of {}: {} {} entities",
            self.store.namespace(),
            ids.len(),
            self.entity_type
        );

        let built = self.build_in_batches(&ids).await?;
        let entries_written = self
            .store
            .replace_all(built.maps.into_iter().map(|m| (m.entity_id.clone(), m)))
            .await?;
        self.store_watermark(started).await?;

        Ok(RefreshReport {
            kind: RefreshKind::Full,
            batches: built.batches,
            entries_written,
            cache_size: self.store.size().await?,
            watermark: Some(started),
            failed_entities: built.failed_entities,
        })
    }

    async fn run_incremental(&self) -> Result<RefreshReport> {
        let Some(since) = self.last_watermark().await? else {
            warn!(
                "No watermark stored for {}, running a full refresh",
                self.store.namespace()
            );
            return self.run_full().await;
        };

        let started = self.clock.now();
        let ids = self
            .repository
            .fetch_changed_since(&self.entity_type, since)
            .await?;
        debug!(
            "Incremental update of {}: {} entities changed since {}",
            self.store.namespace(),
            ids.len(),
            since
        );

        let built = self.build_in_batches(&ids).await?;
        let entries_written = if built.maps.is_empty() {
            0
        } else {
            self.store
                .set_bulk(built.maps.into_iter().map(|m| (m.entity_id.clone(), m)))
                .await?
        };
        self.store_watermark(started).await?;

        Ok(RefreshReport {
            kind: RefreshKind::Incremental,
            batches: built.batches,
            entries_written,
            cache_size: self.store.size().await?,
            watermark: Some(started),
            failed_entities: built.failed_entities,
        })
    }

    /// Fetch and build `ids` in fixed-size batches. Any batch error aborts.
    async fn build_in_batches(&self, ids: &[String]) -> Result<BuiltBatches> {
        let targets = self.cached_formats().await;
        let total = ids.len().div_ceil(self.batch_size);
        let mut built = BuiltBatches {
            maps: Vec::with_capacity(ids.len()),
            batches: 0,
            failed_entities: Vec::new(),
        };

        for (index, chunk) in ids.chunks(self.batch_size).enumerate() {
            let records = self.repository.fetch_records(chunk).await?;
            let output = self.builder.build_batch(records, targets.clone()).await?;

            if !output.failures.is_empty() {
                let failed: Vec<String> =
                    output.failures.into_iter().map(|f| f.entity_id).collect();
                if !self.tolerate_entity_failures {
                    return Err(Error::TransformError(format!(
                        "batch {}/{}: {} entities could not be rendered: {}",
                        index + 1,
                        total,
                        failed.len(),
                        failed.join(", ")
                    )));
                }
                built.failed_entities.extend(failed);
            }

            debug!(
                "Batch {}/{} for {}: {} maps",
                index + 1,
                total,
                self.store.namespace(),
                output.maps.len()
            );
            built.maps.extend(output.maps);
            built.batches += 1;
        }

        Ok(built)
    }

    async fn store_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        self.store
            .set_meta(WATERMARK_FIELD, &canonical_timestamp(&at)?)
            .await
    }

    /// Cached map for one entity.
    pub async fn get(&self, entity_id: &str) -> Result<Option<RevisionFormatMap>> {
        self.store.get_value(entity_id).await
    }

    /// Text of one entity in one format.
    ///
    /// Served from the cached map when present. When the entity is cached
    /// but the format is missing, the format is rendered from the current
    /// record and, if the format is configured for caching, written back
    /// into the map (see [`fill_format`](Self::fill_format)).
    /// Entities absent from the cache (or from the source) yield `None`.
    pub async fn formatted(&self, entity_id: &str, format: &FormatId) -> Result<Option<String>> {
        let Some(map) = self.store.get_value(entity_id).await? else {
            return Ok(None);
        };
        if let Some(text) = map.text(format)? {
            return Ok(Some(text));
        }

        let records = self
            .repository
            .fetch_records(&[entity_id.to_string()])
            .await?;
        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let text = self.builder.render(&record, format)?;

        if self.formats.read().await.is_cached(format) {
            if let Err(e) = self.fill_format(&record, format, &text).await {
                warn!("Failed to cache {} for {}: {}", format, entity_id, e);
            }
        }

        Ok(Some(text))
    }

    /// Merge a rendered format into the cached map of `record`.
    ///
    /// Runs under the cycle guard and is skipped while a cycle is in flight.
    /// The entry is re-read under the guard and only written when it is
    /// still at the rendered revision, so a fill never puts back a revision
    /// a cycle has already replaced.
    async fn fill_format(&self, record: &EntityRecord, format: &FormatId, text: &str) -> Result<()> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!(
                "Not caching {} for {}: a cycle is running",
                format, record.entity_id
            );
            return Ok(());
        };

        let Some(mut current) = self.store.get_value(&record.entity_id).await? else {
            return Ok(());
        };
        if current.revision_id != record.revision_id {
            debug!(
                "Not caching {} for {}: cached revision {} differs from rendered {}",
                format, record.entity_id, current.revision_id, record.revision_id
            );
            return Ok(());
        }

        current.insert_format(format.clone(), text)?;
        self.store.set(&record.entity_id, &current).await?;
        debug!("Filled missing format {} for {}", format, record.entity_id);
        Ok(())
    }
}
