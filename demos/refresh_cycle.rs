//! Full refresh, incremental update and ACL read-through against in-memory
//! collaborators.

use catalog_cache::{
    acl::TemporalRange, backend::InMemoryBackend, builder::RenderedFormats, error::Result,
    AuxiliaryEntityCache, CacheSettings, CacheStore, CollectionAcl, EntityRecord, FormatId,
    InMemoryCatalog, InMemoryRepository, MetadataCacheManager,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Stand-in renderer: wraps the native payload in a format marker.
fn render(record: &EntityRecord, targets: &BTreeSet<FormatId>) -> Result<RenderedFormats> {
    Ok(targets
        .iter()
        .map(|format| {
            (
                format.clone(),
                Ok(format!("<!-- {} -->\n{}", format, record.payload)),
            )
        })
        .collect())
}

fn collection(id: &str, revision: u64) -> EntityRecord {
    EntityRecord {
        entity_id: id.to_string(),
        revision_id: revision,
        native_format: FormatId::simple("echo10"),
        payload: format!(
            "<Collection><ShortName>{}</ShortName><Revision>{}</Revision></Collection>",
            id, revision
        ),
        revision_date: Utc::now(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let settings = CacheSettings::from_env()?;
    let backend = InMemoryBackend::new(settings.namespaces());

    println!("=== Metadata cache ===");
    let catalog = InMemoryCatalog::new(settings.entity_type.clone());
    for i in 0..2500 {
        catalog.insert(collection(&format!("C{:05}-PROV1", i), 1));
    }

    let all_formats = [
        FormatId::simple("echo10"),
        FormatId::simple("dif10"),
        FormatId::simple("iso19115"),
        FormatId::versioned("umm-json", "1.18.1"),
    ];
    let store = CacheStore::new(backend.clone(), &settings.metadata_namespace)?
        .with_ttl(settings.metadata_ttl);
    let manager = MetadataCacheManager::new(
        store,
        Arc::new(catalog.clone()),
        settings.format_builder(Arc::new(render))?,
        settings.manager_config(all_formats),
    )?;

    let outcome = manager.full_refresh().await?;
    println!("Full refresh: {:?}", outcome.report().map(|r| r.cache_size));

    catalog.insert(collection("C00042-PROV1", 2));
    let outcome = manager.incremental_update().await?;
    println!(
        "Incremental update: {:?} entries written",
        outcome.report().map(|r| r.entries_written)
    );

    let dif = manager
        .formatted("C00042-PROV1", &FormatId::simple("dif10"))
        .await?;
    println!("DIF 10 rendering:\n{}", dif.unwrap_or_default());

    println!("\n=== ACL cache ===");
    let acls = InMemoryRepository::new();
    acls.insert(CollectionAcl {
        concept_id: "C00042-PROV1".to_string(),
        provider_id: "PROV1".to_string(),
        entry_title: "Surface Reflectance".to_string(),
        access_value: Some(1.0),
        revision_date: Utc::now(),
        temporal: vec![TemporalRange {
            start: Utc::now(),
            end: None,
            ends_at_present: true,
        }],
    });

    let acl_store =
        CacheStore::new(backend, &settings.acl_namespace)?.with_ttl(settings.acl_ttl);
    let acl_cache = AuxiliaryEntityCache::new(acl_store, Arc::new(acls));
    acl_cache.refresh_entire_cache().await?;

    let fresh = acl_cache.set_cache(&"C00042-PROV1".to_string()).await?;
    println!("Fresh ACL: {:?}", fresh.map(|a| a.entry_title));
    let missing = acl_cache.set_cache(&"C99999-PROV1".to_string()).await?;
    println!("Unknown ACL: {:?}", missing);

    Ok(())
}
