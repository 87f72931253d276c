//! Builds RevisionFormatMaps from raw records, one batch at a time.

use crate::error::{Error, Result};
use crate::format::{EntityRecord, FormatId, RevisionFormatMap};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Per-format rendering results for one entity.
pub type RenderedFormats = BTreeMap<FormatId, Result<String>>;

/// Renders an entity record into other metadata formats.
///
/// An outer `Err` means the entity could not be rendered at all; an inner
/// `Err` fails only that format.
pub trait FormatTransformer: Send + Sync {
    fn transform(
        &self,
        record: &EntityRecord,
        targets: &BTreeSet<FormatId>,
    ) -> Result<RenderedFormats>;
}

impl<F> FormatTransformer for F
where
    F: Fn(&EntityRecord, &BTreeSet<FormatId>) -> Result<RenderedFormats> + Send + Sync,
{
    fn transform(
        &self,
        record: &EntityRecord,
        targets: &BTreeSet<FormatId>,
    ) -> Result<RenderedFormats> {
        self(record, targets)
    }
}

/// An entity left out of a batch because it could not be rendered.
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub entity_id: String,
    pub error: Error,
}

/// Result of building one batch.
#[derive(Debug, Default)]
pub struct BatchOutput {
    pub maps: Vec<RevisionFormatMap>,
    pub failures: Vec<EntityFailure>,
}

/// Turns entity records into compressed multi-format maps.
///
/// Records of a batch are independent, so they are rendered in parallel on
/// a rayon pool. [`build_batch`](Self::build_batch) runs that work on a
/// blocking thread to keep the async runtime responsive.
#[derive(Clone)]
pub struct RevisionFormatMapBuilder {
    transformer: Arc<dyn FormatTransformer>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RevisionFormatMapBuilder {
    /// Builder using the global rayon pool.
    pub fn new(transformer: Arc<dyn FormatTransformer>) -> Self {
        RevisionFormatMapBuilder {
            transformer,
            pool: None,
        }
    }

    /// Render on a dedicated pool of `threads` workers instead of the
    /// global one.
    pub fn with_parallelism(mut self, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("format-builder-{}", i))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build thread pool: {}", e)))?;
        self.pool = Some(Arc::new(pool));
        Ok(self)
    }

    /// Worker count of the dedicated pool, if one was configured.
    pub fn parallelism(&self) -> Option<usize> {
        self.pool.as_ref().map(|pool| pool.current_num_threads())
    }

    /// Build one entity's map.
    ///
    /// The native format comes straight from the record payload; the
    /// transformer is asked only for the other targets. Formats that fail,
    /// and formats nobody asked for, are left out.
    ///
    /// # Errors
    ///
    /// - `Error::TransformError`: the transformer rejected the whole entity
    pub fn build_one(
        &self,
        record: &EntityRecord,
        targets: &BTreeSet<FormatId>,
    ) -> Result<RevisionFormatMap> {
        let mut map = RevisionFormatMap::from_native(record)?;

        let requested: BTreeSet<FormatId> = targets
            .iter()
            .filter(|f| **f != record.native_format)
            .cloned()
            .collect();
        if requested.is_empty() {
            return Ok(map);
        }

        let rendered = self
            .transformer
            .transform(record, &requested)
            .map_err(|e| {
                Error::TransformError(format!("{}: {}", record.entity_id, e))
            })?;

        for (format, result) in rendered {
            if !requested.contains(&format) {
                debug!(
                    "Dropping unrequested format {} for {}",
                    format, record.entity_id
                );
                continue;
            }
            match result {
                Ok(text) => {
                    if let Err(e) = map.insert_format(format.clone(), &text) {
                        warn!(
                            "Failed to compress {} for {}: {}",
                            format, record.entity_id, e
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "Format {} omitted for {}: {}",
                        format, record.entity_id, e
                    );
                }
            }
        }

        Ok(map)
    }

    /// Render a single format of one record, outside of any map.
    pub fn render(&self, record: &EntityRecord, format: &FormatId) -> Result<String> {
        if *format == record.native_format {
            return Ok(record.payload.clone());
        }

        let targets: BTreeSet<FormatId> = [format.clone()].into_iter().collect();
        let mut rendered = self.transformer.transform(record, &targets)?;
        rendered.remove(format).unwrap_or_else(|| {
            Err(Error::TransformError(format!(
                "transformer produced no {} for {}",
                format, record.entity_id
            )))
        })
    }

    /// Build a batch on the calling thread, fanning records out over rayon.
    pub fn build_batch_blocking(
        &self,
        records: &[EntityRecord],
        targets: &BTreeSet<FormatId>,
    ) -> BatchOutput {
        let run = || {
            records
                .par_iter()
                .map(|record| {
                    self.build_one(record, targets)
                        .map_err(|error| EntityFailure {
                            entity_id: record.entity_id.clone(),
                            error,
                        })
                })
                .collect::<Vec<_>>()
        };

        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        let mut output = BatchOutput::default();
        for result in results {
            match result {
                Ok(map) => output.maps.push(map),
                Err(failure) => {
                    warn!(
                        "Entity {} omitted from batch: {}",
                        failure.entity_id, failure.error
                    );
                    output.failures.push(failure);
                }
            }
        }
        output
    }

    /// Build a batch on a blocking thread.
    pub async fn build_batch(
        &self,
        records: Vec<EntityRecord>,
        targets: BTreeSet<FormatId>,
    ) -> Result<BatchOutput> {
        let builder = self.clone();
        tokio::task::spawn_blocking(move || builder.build_batch_blocking(&records, &targets))
            .await
            .map_err(|e| Error::TransformError(format!("batch worker failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> EntityRecord {
        EntityRecord {
            entity_id: id.to_string(),
            revision_id: 1,
            native_format: FormatId::simple("echo10"),
            payload: format!("<Collection><Id>{}</Id></Collection>", id),
            revision_date: Utc::now(),
        }
    }

    fn targets() -> BTreeSet<FormatId> {
        [
            FormatId::simple("echo10"),
            FormatId::simple("dif10"),
            FormatId::simple("iso19115"),
            FormatId::versioned("umm-json", "1.18.1"),
        ]
        .into_iter()
        .collect()
    }

    /// Renders every target as `<format>:<id>`, except `iso19115` for
    /// entity `C` and everything for entity `BAD`.
    fn transformer() -> Arc<dyn FormatTransformer> {
        Arc::new(
            |record: &EntityRecord, targets: &BTreeSet<FormatId>| -> Result<RenderedFormats> {
                if record.entity_id == "BAD" {
                    return Err(Error::TransformError("unparseable payload".to_string()));
                }
                Ok(targets
                    .iter()
                    .map(|f| {
                        let rendered = if record.entity_id == "C" && f.tag() == "iso19115" {
                            Err(Error::TransformError("xslt failed".to_string()))
                        } else {
                            Ok(format!("{}:{}", f, record.entity_id))
                        };
                        (f.clone(), rendered)
                    })
                    .collect())
            },
        )
    }

    #[test]
    fn test_build_one_all_formats() {
        let builder = RevisionFormatMapBuilder::new(transformer());
        let map = builder.build_one(&record("A"), &targets()).expect("build");

        assert_eq!(map.formats().count(), 4);
        assert_eq!(
            map.text(&FormatId::simple("echo10")).expect("read"),
            Some("<Collection><Id>A</Id></Collection>".to_string())
        );
        assert_eq!(
            map.text(&FormatId::versioned("umm-json", "1.18.1"))
                .expect("read"),
            Some("umm-json@1.18.1:A".to_string())
        );
    }

    #[test]
    fn test_single_format_failure_is_contained() {
        let builder = RevisionFormatMapBuilder::new(transformer());
        let map = builder.build_one(&record("C"), &targets()).expect("build");

        assert!(map.contains(&FormatId::simple("echo10")));
        assert!(map.contains(&FormatId::simple("dif10")));
        assert!(map.contains(&FormatId::versioned("umm-json", "1.18.1")));
        assert!(!map.contains(&FormatId::simple("iso19115")));
    }

    #[test]
    fn test_unrequested_formats_are_dropped() {
        let extra: Arc<dyn FormatTransformer> = Arc::new(
            |record: &EntityRecord, _: &BTreeSet<FormatId>| -> Result<RenderedFormats> {
                let mut out = RenderedFormats::new();
                out.insert(FormatId::simple("dif10"), Ok(record.entity_id.clone()));
                out.insert(FormatId::simple("kml"), Ok(record.entity_id.clone()));
                Ok(out)
            },
        );
        let builder = RevisionFormatMapBuilder::new(extra);
        let targets: BTreeSet<FormatId> = [FormatId::simple("dif10")].into_iter().collect();
        let map = builder.build_one(&record("A"), &targets).expect("build");

        let formats: Vec<_> = map.formats().cloned().collect();
        assert_eq!(
            formats,
            vec![FormatId::simple("dif10"), FormatId::simple("echo10")]
        );
        for format in map.formats() {
            assert!(*format == map.native_format || targets.contains(format));
        }
    }

    #[test]
    fn test_native_only_skips_transformer() {
        let never: Arc<dyn FormatTransformer> = Arc::new(
            |_: &EntityRecord, _: &BTreeSet<FormatId>| -> Result<RenderedFormats> {
                panic!("transformer must not run")
            },
        );
        let builder = RevisionFormatMapBuilder::new(never);
        let targets: BTreeSet<FormatId> = [FormatId::simple("echo10")].into_iter().collect();
        let map = builder.build_one(&record("A"), &targets).expect("build");
        assert_eq!(map.formats().count(), 1);
    }

    #[tokio::test]
    async fn test_batch_reports_entity_failures() {
        let builder = RevisionFormatMapBuilder::new(transformer())
            .with_parallelism(2)
            .expect("pool");
        let records = vec![record("A"), record("BAD"), record("C")];

        let output = builder
            .build_batch(records, targets())
            .await
            .expect("batch");

        assert_eq!(output.maps.len(), 2);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].entity_id, "BAD");
        assert!(matches!(
            output.failures[0].error,
            Error::TransformError(_)
        ));
    }
}
