//! # catalog-cache
//!
//! Multi-format revision cache for metadata catalogs.
//!
//! Rendering catalog metadata into every supported dialect is expensive, so
//! this crate renders each entity once per change and serves every request
//! from a cache of compressed renderings.
//!
//! ## Features
//!
//! - **RevisionFormatMap:** One cache entry per entity holding gzip-compressed
//!   renderings keyed by [`FormatId`]
//! - **Two refresh protocols:** Full refresh (replace the namespace) and
//!   incremental update (merge changes since a watermark)
//! - **Backend Agnostic:** In-memory and Redis backends behind [`CacheBackend`]
//! - **Auxiliary caches:** Whole-namespace mirrors of secondary entity types
//!   with single-entity read-through, e.g. access-control projections
//! - **Text-safe storage:** Timestamps in nested values survive backends
//!   that only hold text (see [`adapter`])
//!
//! ## Quick Start
//!
//! ```ignore
//! use catalog_cache::{
//!     backend::InMemoryBackend, CacheSettings, CacheStore, InMemoryCatalog,
//!     MetadataCacheManager,
//! };
//!
//! let settings = CacheSettings::from_env()?;
//! let backend = InMemoryBackend::new(settings.namespaces());
//! let store = CacheStore::new(backend, &settings.metadata_namespace)?
//!     .with_ttl(settings.metadata_ttl);
//!
//! let manager = MetadataCacheManager::new(
//!     store,
//!     Arc::new(catalog),
//!     settings.format_builder(Arc::new(renderer))?,
//!     settings.manager_config(all_formats),
//! )?;
//!
//! manager.full_refresh().await?;
//! let dif = manager.formatted("C1-PROV1", &FormatId::simple("dif10")).await?;
//! ```

#[macro_use]
extern crate log;

pub mod acl;
pub mod adapter;
pub mod auxiliary;
pub mod backend;
pub mod builder;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod format;
pub mod jobs;
pub mod manager;
pub mod observability;
pub mod repository;
pub mod serialization;
pub mod store;

// Re-exports for convenience
pub use acl::CollectionAcl;
pub use auxiliary::AuxiliaryEntityCache;
pub use backend::CacheBackend;
pub use builder::{FormatTransformer, RevisionFormatMapBuilder};
pub use config::CacheSettings;
pub use entity::CacheEntity;
pub use error::{Error, Result};
pub use format::{CachedFormatsConfig, EntityRecord, FormatId, RevisionFormatMap};
pub use jobs::{JobSpec, RefreshTarget, Trigger};
pub use manager::{CacheManagerConfig, MetadataCacheManager, RefreshOutcome, RefreshReport};
pub use repository::{CatalogRepository, DataRepository, InMemoryCatalog, InMemoryRepository};
pub use store::CacheStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
