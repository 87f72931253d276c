//! Whole-namespace caches of secondary entity types.
//!
//! An auxiliary cache mirrors every entity a [`DataRepository`] returns into
//! one namespace. It is refreshed wholesale on a short schedule and can be
//! refreshed for a single entity when a caller needs a value that is
//! guaranteed current, e.g. right before an authorization decision.

use crate::backend::CacheBackend;
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::jobs::RefreshTarget;
use crate::manager::{RefreshOutcome, RefreshReport};
use crate::observability::RefreshKind;
use crate::repository::DataRepository;
use crate::store::CacheStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AuxiliaryEntityCache<B, T, R>
where
    B: CacheBackend,
    T: CacheEntity,
    R: DataRepository<T>,
{
    store: CacheStore<B, T>,
    repository: Arc<R>,
    in_flight: Mutex<()>,
}

impl<B, T, R> AuxiliaryEntityCache<B, T, R>
where
    B: CacheBackend,
    T: CacheEntity,
    R: DataRepository<T>,
{
    pub fn new(store: CacheStore<B, T>, repository: Arc<R>) -> Self {
        AuxiliaryEntityCache {
            store,
            repository,
            in_flight: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CacheStore<B, T> {
        &self.store
    }

    /// Run the cycle a scheduled job asks for. Auxiliary caches only support
    /// full refreshes.
    pub async fn run(&self, target: RefreshTarget) -> Result<RefreshOutcome> {
        match target {
            RefreshTarget::Full => self.refresh_entire_cache().await,
            RefreshTarget::Incremental => Err(Error::ConfigError(format!(
                "{} only supports full refreshes",
                self.store.namespace()
            ))),
        }
    }

    /// Fetch every entity and overwrite the namespace with them.
    pub async fn refresh_entire_cache(&self) -> Result<RefreshOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!(
                "Skipping refresh of {}: already running",
                self.store.namespace()
            );
            return Ok(RefreshOutcome::Skipped);
        };

        let timer = Instant::now();
        let result = async {
            let entities = self.repository.fetch_all().await?;
            let entries_written = self
                .store
                .replace_all(
                    entities
                        .into_iter()
                        .map(|e| (e.cache_key().to_string(), e)),
                )
                .await?;
            Ok::<_, Error>(RefreshReport {
                kind: RefreshKind::Auxiliary,
                batches: 1,
                entries_written,
                cache_size: self.store.size().await?,
                watermark: None,
                failed_entities: Vec::new(),
            })
        }
        .await;

        let metrics = self.store.metrics();
        match result {
            Ok(report) => {
                info!(
                    "✓ {} of {} finished in {:?}: cache size {}",
                    report.kind,
                    self.store.namespace(),
                    timer.elapsed(),
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
                error!(
                    "✗ {} of {} failed: {}",
                    RefreshKind::Auxiliary,
                    self.store.namespace(),
                    e
                );
                metrics.record_refresh_failure(
                    self.store.namespace(),
                    RefreshKind::Auxiliary,
                    &e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Fetch one entity from the source, write it and return it.
    ///
    /// `None` means the source does not know the entity. Nothing is written
    /// in that case and a previously cached value is left alone until the
    /// next full refresh.
    pub async fn set_cache(&self, id: &T::Key) -> Result<Option<T>> {
        let timer = Instant::now();
        let Some(entity) = self.repository.fetch_by_id(id).await? else {
            debug!("{} not found for {}", id, self.store.namespace());
            return Ok(None);
        };

        self.store.set(&id.to_string(), &entity).await?;
        self.store.metrics().record_refresh(
            self.store.namespace(),
            RefreshKind::Single,
            1,
            timer.elapsed(),
        );
        debug!("✓ {} refreshed in {}", id, self.store.namespace());
        Ok(Some(entity))
    }

    /// Cached value, reading through to [`set_cache`](Self::set_cache) on a
    /// miss.
    ///
    /// An entry that can no longer be decoded counts as a miss and is
    /// replaced from the source. Backend failures propagate.
    pub async fn get(&self, id: &T::Key) -> Result<Option<T>> {
        match self.store.get_value(&id.to_string()).await {
            Ok(Some(entity)) => return Ok(Some(entity)),
            Ok(None) => {}
            Err(e) if e.is_systemic() => return Err(e),
            Err(e) => {
                warn!(
                    "Unreadable entry {}/{} treated as miss: {}",
                    self.store.namespace(),
                    id,
                    e
                );
            }
        }
        self.set_cache(id).await
    }
}
