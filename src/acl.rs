//! Access-control projection of catalog collections.
//!
//! Policy evaluation needs a handful of collection attributes, several of
//! them timestamps. The projection is stored through the storability
//! adapter rather than the binary envelope so that those timestamps survive
//! backends that only hold text.

use crate::adapter;
use crate::entity::CacheEntity;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Temporal extent of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemporalRange {
    #[serde(with = "adapter::inst")]
    pub start: DateTime<Utc>,
    #[serde(with = "adapter::inst::option")]
    pub end: Option<DateTime<Utc>>,
    pub ends_at_present: bool,
}

/// Attributes of one collection relevant to access-control decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollectionAcl {
    pub concept_id: String,
    pub provider_id: String,
    pub entry_title: String,
    pub access_value: Option<f64>,
    #[serde(with = "adapter::inst")]
    pub revision_date: DateTime<Utc>,
    pub temporal: Vec<TemporalRange>,
}

impl CacheEntity for CollectionAcl {
    type Key = String;

    fn cache_key(&self) -> Self::Key {
        self.concept_id.clone()
    }

    fn serialize_for_cache(&self) -> Result<Vec<u8>> {
        adapter::encode(self)
    }

    fn deserialize_from_cache(bytes: &[u8]) -> Result<Self> {
        adapter::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::TimeZone;

    fn acl(id: &str, access_value: Option<f64>) -> CollectionAcl {
        CollectionAcl {
            concept_id: id.to_string(),
            provider_id: "PROV1".to_string(),
            entry_title: format!("Entry {}", id),
            access_value,
            revision_date: Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 15).unwrap(),
            temporal: vec![TemporalRange {
                start: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
                end: None,
                ends_at_present: true,
            }],
        }
    }

    #[test]
    fn test_stored_form_is_text_safe_json() {
        let bytes = acl("C1-PROV1", Some(1.5))
            .serialize_for_cache()
            .expect("Failed to serialize");
        let json: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

        assert_eq!(json["revision-date"], "#inst 2024-02-29T12:30:15Z");
        assert_eq!(json["temporal"][0]["start"], "#inst 2000-01-01T00:00:00Z");
        assert_eq!(json["temporal"][0]["end"], serde_json::Value::Null);
        assert_eq!(json["temporal"][0]["ends-at-present"], true);
        assert_eq!(json["entry-title"], "Entry C1-PROV1");
    }

    #[test]
    fn test_round_trip() {
        for value in [acl("C1-PROV1", Some(1.5)), acl("C2-PROV1", None)] {
            let bytes = value.serialize_for_cache().expect("Failed to serialize");
            let back = CollectionAcl::deserialize_from_cache(&bytes).expect("Failed to load");
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_whole_number_access_value_round_trips() {
        let value = acl("C3-PROV1", Some(2.0));
        let bytes = value.serialize_for_cache().expect("Failed to serialize");
        let back = CollectionAcl::deserialize_from_cache(&bytes).expect("Failed to load");
        assert_eq!(back.access_value, Some(2.0));
    }

    #[test]
    fn test_unstorable_value_is_rejected() {
        let result = acl("C4-PROV1", Some(f64::INFINITY)).serialize_for_cache();
        assert!(matches!(result, Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_missing_field_is_reported() {
        let result = CollectionAcl::deserialize_from_cache(br#"{"concept-id":"C1"}"#);
        assert!(matches!(result, Err(Error::DeserializationError(_))));
    }
}
