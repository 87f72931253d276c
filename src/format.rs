//! Format identifiers, raw entity records and the multi-format cache entry.

use crate::codec;
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Identifier of a metadata format.
///
/// Some dialects are pinned to a schema version (`umm-json@1.18.1`), others
/// are not (`echo10`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FormatId {
    Simple(String),
    Versioned(String, String),
}

impl FormatId {
    pub fn simple(tag: impl Into<String>) -> Self {
        FormatId::Simple(tag.into())
    }

    pub fn versioned(tag: impl Into<String>, version: impl Into<String>) -> Self {
        FormatId::Versioned(tag.into(), version.into())
    }

    pub fn tag(&self) -> &str {
        match self {
            FormatId::Simple(tag) | FormatId::Versioned(tag, _) => tag,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            FormatId::Simple(_) => None,
            FormatId::Versioned(_, version) => Some(version),
        }
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatId::Simple(tag) => write!(f, "{}", tag),
            FormatId::Versioned(tag, version) => write!(f, "{}@{}", tag, version),
        }
    }
}

impl FromStr for FormatId {
    type Err = Error;

    /// Parses `tag` or `tag@version`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::ValidationError(format!("invalid format id: {:?}", s));
        match s.split_once('@') {
            Some((tag, version)) => {
                if tag.is_empty() || version.is_empty() || version.contains('@') {
                    return Err(invalid());
                }
                Ok(FormatId::versioned(tag, version))
            }
            None if s.is_empty() => Err(invalid()),
            None => Ok(FormatId::simple(s)),
        }
    }
}

/// The set of formats kept in the cache: every known format minus the
/// operator-excluded ones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedFormatsConfig {
    all: BTreeSet<FormatId>,
    excluded: BTreeSet<FormatId>,
}

impl CachedFormatsConfig {
    pub fn new(all: impl IntoIterator<Item = FormatId>) -> Self {
        CachedFormatsConfig {
            all: all.into_iter().collect(),
            excluded: BTreeSet::new(),
        }
    }

    pub fn with_excluded(mut self, excluded: impl IntoIterator<Item = FormatId>) -> Self {
        self.excluded = excluded.into_iter().collect();
        self
    }

    /// Formats the builder should produce.
    pub fn cached_formats(&self) -> BTreeSet<FormatId> {
        self.all.difference(&self.excluded).cloned().collect()
    }

    pub fn is_cached(&self, format: &FormatId) -> bool {
        self.all.contains(format) && !self.excluded.contains(format)
    }

    pub fn excluded(&self) -> &BTreeSet<FormatId> {
        &self.excluded
    }
}

/// Raw record as returned by the authoritative source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub revision_id: u64,
    pub native_format: FormatId,
    /// Metadata text in the native format.
    pub payload: String,
    pub revision_date: DateTime<Utc>,
}

/// One entity's compressed representations, keyed by format.
///
/// Always holds the native format. Every other key was part of the cached
/// format set when the map was built. A missing format was either not
/// requested or failed to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionFormatMap {
    pub entity_id: String,
    pub revision_id: u64,
    pub native_format: FormatId,
    formats: BTreeMap<FormatId, Vec<u8>>,
}

impl RevisionFormatMap {
    /// Start a map from a record, compressing its native payload.
    pub fn from_native(record: &EntityRecord) -> Result<Self> {
        let mut formats = BTreeMap::new();
        formats.insert(
            record.native_format.clone(),
            codec::compress(&record.payload)?,
        );
        Ok(RevisionFormatMap {
            entity_id: record.entity_id.clone(),
            revision_id: record.revision_id,
            native_format: record.native_format.clone(),
            formats,
        })
    }

    /// Compress and add a rendered format, replacing any previous rendering.
    pub fn insert_format(&mut self, format: FormatId, text: &str) -> Result<()> {
        let bytes = codec::compress(text)?;
        self.formats.insert(format, bytes);
        Ok(())
    }

    pub fn contains(&self, format: &FormatId) -> bool {
        self.formats.contains_key(format)
    }

    /// Decompressed text for `format`, if present.
    pub fn text(&self, format: &FormatId) -> Result<Option<String>> {
        self.formats
            .get(format)
            .map(|bytes| codec::decompress(bytes))
            .transpose()
    }

    pub fn formats(&self) -> impl Iterator<Item = &FormatId> {
        self.formats.keys()
    }

    pub fn compressed_size(&self) -> usize {
        self.formats.values().map(Vec::len).sum()
    }
}

impl CacheEntity for RevisionFormatMap {
    type Key = String;

    fn cache_key(&self) -> Self::Key {
        self.entity_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> EntityRecord {
        EntityRecord {
            entity_id: "C100-PROV1".to_string(),
            revision_id: 4,
            native_format: FormatId::simple("echo10"),
            payload: "<Collection/>".to_string(),
            revision_date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_format_id_parse_and_display() {
        let simple: FormatId = "dif10".parse().expect("Failed to parse");
        assert_eq!(simple, FormatId::simple("dif10"));
        assert_eq!(simple.to_string(), "dif10");

        let versioned: FormatId = " umm-json@1.18.1 ".parse().expect("Failed to parse");
        assert_eq!(versioned, FormatId::versioned("umm-json", "1.18.1"));
        assert_eq!(versioned.version(), Some("1.18.1"));
        assert_eq!(versioned.to_string(), "umm-json@1.18.1");

        for bad in ["", "@1.0", "umm-json@", "a@b@c"] {
            assert!(bad.parse::<FormatId>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_cached_formats_excludes() {
        let config = CachedFormatsConfig::new([
            FormatId::simple("echo10"),
            FormatId::simple("iso19115"),
            FormatId::versioned("umm-json", "1.18.1"),
        ])
        .with_excluded([FormatId::simple("iso19115")]);

        let cached = config.cached_formats();
        assert_eq!(cached.len(), 2);
        assert!(!config.is_cached(&FormatId::simple("iso19115")));
        assert!(!config.is_cached(&FormatId::simple("unknown")));
        assert!(config.is_cached(&FormatId::versioned("umm-json", "1.18.1")));
    }

    #[test]
    fn test_map_always_holds_native() {
        let mut map = RevisionFormatMap::from_native(&record()).expect("Failed to build");
        assert!(map.contains(&FormatId::simple("echo10")));
        assert_eq!(
            map.text(&FormatId::simple("echo10")).expect("Failed to read"),
            Some("<Collection/>".to_string())
        );

        map.insert_format(FormatId::simple("dif10"), "<DIF/>")
            .expect("Failed to insert");
        assert_eq!(map.formats().count(), 2);
        assert_eq!(map.text(&FormatId::simple("iso19115")).expect("read"), None);
    }

    #[test]
    fn test_map_cache_round_trip() {
        let map = RevisionFormatMap::from_native(&record()).expect("Failed to build");
        let bytes = map.serialize_for_cache().expect("Failed to serialize");
        let back = RevisionFormatMap::deserialize_from_cache(&bytes).expect("Failed to load");
        assert_eq!(back, map);
        assert_eq!(back.cache_key(), "C100-PROV1");
    }
}
