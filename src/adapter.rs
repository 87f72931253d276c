//! Storability adapter for values carrying non-primitive fields.
//!
//! Backends only hold text-safe data, so values are lowered through their
//! serde impls into a [`StoreValue`] tree and then into JSON. Timestamp
//! fields opt in with `#[serde(with = "adapter::inst")]`.
//!
//! Timestamps have no JSON type: the pre-store transform renders them as
//! `"#inst <rfc3339>"` strings and the post-load transform turns them back
//! into timestamps. Plain text beginning
//! with `#` is escaped with a second `#`, so the two can never be confused.
//!
//! `post_load_transform(pre_store_transform(v)?)? == v` holds for every value
//! the pre-store transform accepts.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::ser::{self, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

const INST_TAG: &str = "#inst ";
const ESCAPE: char = '#';

/// Dynamically typed value accepted by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Seq(Vec<StoreValue>),
    Map(BTreeMap<String, StoreValue>),
}

/// Canonical text form of a timestamp (RFC 3339, UTC, `Z` suffix).
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> Result<String> {
    if !(0..=9999).contains(&ts.year()) {
        return Err(Error::SerializationError(format!(
            "timestamp {:?} is outside the storable range",
            ts
        )));
    }
    Ok(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Parse a timestamp written by [`canonical_timestamp`].
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::DeserializationError(format!("bad timestamp {:?}: {}", text, e)))
}

/// Lower a value into storable JSON, recursing through sequences and maps.
///
/// # Errors
///
/// - `Error::SerializationError`: non-finite float or out of range timestamp.
///   Nothing is produced for a rejected value.
pub fn pre_store_transform(value: &StoreValue) -> Result<Value> {
    Ok(match value {
        StoreValue::Null => Value::Null,
        StoreValue::Bool(b) => Value::Bool(*b),
        StoreValue::Int(i) => Value::Number((*i).into()),
        StoreValue::Float(f) => Value::Number(Number::from_f64(*f).ok_or_else(|| {
            Error::SerializationError(format!("float {} has no storable form", f))
        })?),
        StoreValue::Text(s) if s.starts_with(ESCAPE) => Value::String(format!("{}{}", ESCAPE, s)),
        StoreValue::Text(s) => Value::String(s.clone()),
        StoreValue::Timestamp(ts) => {
            Value::String(format!("{}{}", INST_TAG, canonical_timestamp(ts)?))
        }
        StoreValue::Seq(items) => Value::Array(
            items
                .iter()
                .map(pre_store_transform)
                .collect::<Result<Vec<_>>>()?,
        ),
        StoreValue::Map(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (k, v) in fields {
                out.insert(k.clone(), pre_store_transform(v)?);
            }
            Value::Object(out)
        }
    })
}

/// Inverse of [`pre_store_transform`].
pub fn post_load_transform(value: Value) -> Result<StoreValue> {
    Ok(match value {
        Value::Null => StoreValue::Null,
        Value::Bool(b) => StoreValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => StoreValue::Int(i),
            None => StoreValue::Float(n.as_f64().ok_or_else(|| {
                Error::DeserializationError(format!("unreadable number {}", n))
            })?),
        },
        Value::String(s) => {
            if let Some(ts) = s.strip_prefix(INST_TAG) {
                StoreValue::Timestamp(parse_timestamp(ts)?)
            } else if let Some(escaped) = s.strip_prefix(ESCAPE) {
                if !escaped.starts_with(ESCAPE) {
                    return Err(Error::DeserializationError(format!(
                        "unknown tagged value {:?}",
                        s
                    )));
                }
                StoreValue::Text(escaped.to_string())
            } else {
                StoreValue::Text(s)
            }
        }
        Value::Array(items) => StoreValue::Seq(
            items
                .into_iter()
                .map(post_load_transform)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(fields) => {
            let mut out = BTreeMap::new();
            for (k, v) in fields {
                out.insert(k, post_load_transform(v)?);
            }
            StoreValue::Map(out)
        }
    })
}

/// Marker newtype name that flags a serialized string as a timestamp.
const INST_MARKER: &str = "$catalog_cache::inst";

/// Serde `with` module for timestamp fields of adapter-encoded values.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Granule {
///     #[serde(with = "adapter::inst")]
///     updated: DateTime<Utc>,
///     #[serde(with = "adapter::inst::option")]
///     deleted: Option<DateTime<Utc>>,
/// }
/// ```
///
/// Other serializers see a plain RFC 3339 string.
pub mod inst {
    use super::{parse_timestamp, INST_MARKER};
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(
            INST_MARKER,
            &ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_timestamp(&text).map_err(D::Error::custom)
    }

    /// Same for optional timestamps; `None` is stored as null.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        struct Inst<'a>(&'a DateTime<Utc>);

        impl Serialize for Inst<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                super::serialize(self.0, serializer)
            }
        }

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => serializer.serialize_some(&Inst(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapped(#[serde(with = "crate::adapter::inst")] DateTime<Utc>);

            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(ts)| ts))
        }
    }
}

/// Lower any serializable value into a [`StoreValue`] tree.
///
/// Fields marked with [`inst`] become [`StoreValue::Timestamp`]s. Enum
/// variants with data become single-entry maps keyed by the variant name.
pub fn to_store_value<T: Serialize + ?Sized>(value: &T) -> Result<StoreValue> {
    value.serialize(StoreValueSerializer)
}

/// Rebuild a value from a [`StoreValue`] tree. Timestamps are handed to
/// the value's `Deserialize` impl as RFC 3339 strings.
pub fn from_store_value<T: DeserializeOwned>(value: StoreValue) -> Result<T> {
    serde_json::from_value(lower(value))
        .map_err(|e| Error::DeserializationError(e.to_string()))
}

fn lower(value: StoreValue) -> Value {
    match value {
        StoreValue::Null => Value::Null,
        StoreValue::Bool(b) => Value::Bool(b),
        StoreValue::Int(i) => Value::Number(i.into()),
        StoreValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        StoreValue::Text(s) => Value::String(s),
        StoreValue::Timestamp(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        StoreValue::Seq(items) => Value::Array(items.into_iter().map(lower).collect()),
        StoreValue::Map(fields) => {
            Value::Object(fields.into_iter().map(|(k, v)| (k, lower(v))).collect())
        }
    }
}

/// Serialize a value through the pre-store transform into JSON bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let json = pre_store_transform(&to_store_value(value)?)?;
    Ok(serde_json::to_vec(&json)?)
}

/// Parse JSON bytes written by [`encode`] and run the post-load transform.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let json: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::DeserializationError(e.to_string()))?;
    from_store_value(post_load_transform(json)?)
}

struct StoreValueSerializer;

impl ser::Serializer for StoreValueSerializer {
    type Ok = StoreValue;
    type Error = Error;
    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantBuilder<SeqBuilder>;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = VariantBuilder<MapBuilder>;

    fn serialize_bool(self, v: bool) -> Result<StoreValue> {
        Ok(StoreValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<StoreValue> {
        Ok(StoreValue::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<StoreValue> {
        Ok(StoreValue::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<StoreValue> {
        Ok(StoreValue::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<StoreValue> {
        Ok(StoreValue::Int(v))
    }

    fn serialize_u8(self, v: u8) -> Result<StoreValue> {
        Ok(StoreValue::Int(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<StoreValue> {
        Ok(StoreValue::Int(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<StoreValue> {
        Ok(StoreValue::Int(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<StoreValue> {
        i64::try_from(v)
            .map(StoreValue::Int)
            .map_err(|_| Error::SerializationError(format!("integer {} is out of range", v)))
    }

    fn serialize_f32(self, v: f32) -> Result<StoreValue> {
        Ok(StoreValue::Float(v.into()))
    }

    fn serialize_f64(self, v: f64) -> Result<StoreValue> {
        Ok(StoreValue::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<StoreValue> {
        Ok(StoreValue::Text(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<StoreValue> {
        Ok(StoreValue::Text(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<StoreValue> {
        Ok(StoreValue::Seq(
            v.iter().map(|b| StoreValue::Int((*b).into())).collect(),
        ))
    }

    fn serialize_none(self) -> Result<StoreValue> {
        Ok(StoreValue::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<StoreValue> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<StoreValue> {
        Ok(StoreValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<StoreValue> {
        Ok(StoreValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<StoreValue> {
        Ok(StoreValue::Text(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<StoreValue> {
        let inner = value.serialize(self)?;
        if name != INST_MARKER {
            return Ok(inner);
        }
        match inner {
            StoreValue::Text(text) => parse_timestamp(&text)
                .map(StoreValue::Timestamp)
                .map_err(|e| Error::SerializationError(e.to_string())),
            other => Err(Error::SerializationError(format!(
                "timestamp field serialized as {:?}",
                other
            ))),
        }
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<StoreValue> {
        let mut fields = BTreeMap::new();
        fields.insert(variant.to_string(), value.serialize(self)?);
        Ok(StoreValue::Map(fields))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder> {
        Ok(SeqBuilder(Vec::with_capacity(len.unwrap_or(0))))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SeqBuilder> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantBuilder<SeqBuilder>> {
        Ok(VariantBuilder {
            variant,
            inner: SeqBuilder(Vec::with_capacity(len)),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder> {
        Ok(MapBuilder::default())
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<MapBuilder> {
        Ok(MapBuilder::default())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantBuilder<MapBuilder>> {
        Ok(VariantBuilder {
            variant,
            inner: MapBuilder::default(),
        })
    }
}

struct SeqBuilder(Vec<StoreValue>);

impl SeqBuilder {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.0.push(value.serialize(StoreValueSerializer)?);
        Ok(())
    }
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(StoreValue::Seq(self.0))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(StoreValue::Seq(self.0))
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(StoreValue::Seq(self.0))
    }
}

#[derive(Default)]
struct MapBuilder {
    fields: BTreeMap<String, StoreValue>,
    next_key: Option<String>,
}

impl MapBuilder {
    fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> Result<()> {
        self.fields.insert(key, value.serialize(StoreValueSerializer)?);
        Ok(())
    }
}

impl ser::SerializeMap for MapBuilder {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        match key.serialize(StoreValueSerializer)? {
            StoreValue::Text(key) => {
                self.next_key = Some(key);
                Ok(())
            }
            other => Err(Error::SerializationError(format!(
                "map key {:?} is not text",
                other
            ))),
        }
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let key = self.next_key.take().ok_or_else(|| {
            Error::SerializationError("map value without a key".to_string())
        })?;
        self.insert(key, value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(StoreValue::Map(self.fields))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.insert(key.to_string(), value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(StoreValue::Map(self.fields))
    }
}

/// Data of an enum variant, wrapped as `{variant: data}` on completion.
struct VariantBuilder<I> {
    variant: &'static str,
    inner: I,
}

impl<I> VariantBuilder<I> {
    fn wrap(variant: &'static str, data: StoreValue) -> StoreValue {
        let mut fields = BTreeMap::new();
        fields.insert(variant.to_string(), data);
        StoreValue::Map(fields)
    }
}

impl ser::SerializeTupleVariant for VariantBuilder<SeqBuilder> {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.inner.push(value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(Self::wrap(self.variant, StoreValue::Seq(self.inner.0)))
    }
}

impl ser::SerializeStructVariant for VariantBuilder<MapBuilder> {
    type Ok = StoreValue;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.inner.insert(key.to_string(), value)
    }

    fn end(self) -> Result<StoreValue> {
        Ok(Self::wrap(self.variant, StoreValue::Map(self.inner.fields)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).single().expect("valid timestamp")
    }

    #[test]
    fn test_timestamp_leaf_is_tagged() {
        let value = StoreValue::Timestamp(ts(1_700_000_000, 0));
        let json = pre_store_transform(&value).expect("Failed to transform");
        assert_eq!(json, Value::String("#inst 2023-11-14T22:13:20Z".to_string()));
    }

    #[test]
    fn test_nested_structures_round_trip() {
        let mut inner = BTreeMap::new();
        inner.insert("start".to_string(), StoreValue::Timestamp(ts(0, 0)));
        inner.insert("end".to_string(), StoreValue::Null);

        let mut outer = BTreeMap::new();
        outer.insert("temporal".to_string(), StoreValue::Map(inner));
        outer.insert(
            "dates".to_string(),
            StoreValue::Seq(vec![
                StoreValue::Timestamp(ts(1_600_000_000, 123_456_789)),
                StoreValue::Text("plain".to_string()),
            ]),
        );
        outer.insert("count".to_string(), StoreValue::Int(42));
        outer.insert("ratio".to_string(), StoreValue::Float(1.0));
        let value = StoreValue::Map(outer);

        let json = pre_store_transform(&value).expect("Failed to transform");
        let back = post_load_transform(json).expect("Failed to load");
        assert_eq!(back, value);
    }

    #[test]
    fn test_text_that_looks_tagged_survives() {
        for text in ["#inst 2020-01-01T00:00:00Z", "#", "##double", "#hashtag"] {
            let value = StoreValue::Text(text.to_string());
            let json = pre_store_transform(&value).expect("Failed to transform");
            assert_eq!(post_load_transform(json).expect("Failed to load"), value);
        }
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        let value = StoreValue::Seq(vec![StoreValue::Int(1), StoreValue::Float(f64::NAN)]);
        assert!(matches!(
            pre_store_transform(&value),
            Err(Error::SerializationError(_))
        ));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result = post_load_transform(Value::String("#uuid abc".to_string()));
        assert!(matches!(result, Err(Error::DeserializationError(_))));
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct Granule {
        granule_ur: String,
        #[serde(with = "crate::adapter::inst")]
        updated_at: DateTime<Utc>,
        #[serde(with = "crate::adapter::inst::option")]
        deleted_at: Option<DateTime<Utc>>,
        cloud_cover: Option<f64>,
        tags: Vec<String>,
    }

    fn granule() -> Granule {
        Granule {
            granule_ur: "G1-PROV1".to_string(),
            updated_at: ts(1_700_000_000, 500),
            deleted_at: None,
            cloud_cover: Some(12.5),
            tags: vec!["#ocean".to_string(), "land".to_string()],
        }
    }

    #[test]
    fn test_serde_struct_is_lowered_with_tagged_timestamps() {
        let value = to_store_value(&granule()).expect("Failed to lower");
        let mut fields = match value {
            StoreValue::Map(fields) => fields,
            other => panic!("expected map, got {:?}", other),
        };
        assert_eq!(
            fields.remove("updated-at"),
            Some(StoreValue::Timestamp(ts(1_700_000_000, 500)))
        );
        assert_eq!(fields.remove("deleted-at"), Some(StoreValue::Null));
        assert_eq!(
            fields.remove("granule-ur"),
            Some(StoreValue::Text("G1-PROV1".to_string()))
        );
    }

    #[test]
    fn test_serde_struct_round_trip() {
        for value in [
            granule(),
            Granule {
                deleted_at: Some(ts(1_800_000_000, 0)),
                cloud_cover: None,
                ..granule()
            },
        ] {
            let bytes = encode(&value).expect("Failed to encode");
            let back: Granule = decode(&bytes).expect("Failed to decode");
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_untagged_timestamps_stay_text() {
        // Without the `inst` attribute chrono's own string form is stored.
        let dates = vec![Some(ts(5, 0)), None];
        let value = to_store_value(&dates).expect("Failed to lower");
        assert!(matches!(&value, StoreValue::Seq(items) if matches!(items[0], StoreValue::Text(_))));
        let back: Vec<Option<DateTime<Utc>>> =
            decode(&encode(&dates).expect("Failed to encode")).expect("Failed to decode");
        assert_eq!(back, dates);
    }

    proptest! {
        #[test]
        fn prop_timestamp_round_trip(
            secs in -62_135_596_800i64..253_402_300_799i64,
            nanos in 0u32..1_000_000_000u32,
        ) {
            let value = StoreValue::Timestamp(ts(secs, nanos));
            let json = pre_store_transform(&value).unwrap();
            prop_assert_eq!(post_load_transform(json).unwrap(), value);
        }

        #[test]
        fn prop_text_round_trip(text in any::<String>()) {
            let value = StoreValue::Text(text);
            let json = pre_store_transform(&value).unwrap();
            prop_assert_eq!(post_load_transform(json).unwrap(), value);
        }
    }
}
