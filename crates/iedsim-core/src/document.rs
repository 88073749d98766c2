//! Generic self-describing document used for every request, response and
//! device-model description.
//!
//! A [`Document`] is the in-memory form of one msgpack value. It implements
//! serde's `Serialize`/`Deserialize`, so the same type round-trips through
//! `rmp_serde` on the wire and through `serde_json::Value` in tests.

use crate::{Result, SimError};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// One node of a generic document.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Document {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    /// Unsigned integer above `i64::MAX`. Smaller values are always `Integer`.
    UInteger(u64),
    Float(f64),
    /// Single-precision float, kept apart so it re-encodes as float32.
    Float32(f32),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Document>),
    Map(BTreeMap<String, Document>),
}

impl Document {
    /// An empty map document.
    pub fn empty_map() -> Self {
        Document::Map(BTreeMap::new())
    }

    /// Decode one msgpack value.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(SimError::Codec {
                message: "empty document".to_string(),
            });
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode as one msgpack value.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Look up a map entry. Returns `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Document> {
        match self {
            Document::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Like [`get`](Self::get), but a nil entry counts as absent.
    pub fn field(&self, key: &str) -> Option<&Document> {
        self.get(key).filter(|value| !value.is_nil())
    }

    /// String entry of a map, if present and a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Document::as_str)
    }

    /// Insert into a map document. No-op for other kinds.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Document>) {
        if let Document::Map(map) = self {
            map.insert(key.into(), value.into());
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Document::Nil)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Document::Map(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Document::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Document::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Document::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Document::Integer(i) => u64::try_from(*i).ok(),
            Document::UInteger(u) => Some(*u),
            _ => None,
        }
    }

    /// Numeric value as a float; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Document::Float(f) => Some(*f),
            Document::Float32(f) => Some(f64::from(*f)),
            Document::Integer(i) => Some(*i as f64),
            Document::UInteger(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// Integer value of an integer or a whole float.
    pub fn as_whole_i64(&self) -> Option<i64> {
        match self {
            Document::Integer(i) => Some(*i),
            Document::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(*f as i64),
            Document::Float32(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Document]> {
        match self {
            Document::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Document>> {
        match self {
            Document::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Nil => "nil",
            Document::Bool(_) => "bool",
            Document::Integer(_) | Document::UInteger(_) => "integer",
            Document::Float(_) | Document::Float32(_) => "float",
            Document::String(_) => "string",
            Document::Binary(_) => "binary",
            Document::Array(_) => "array",
            Document::Map(_) => "map",
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Document {
    fn from(value: bool) -> Self {
        Document::Bool(value)
    }
}

impl From<i64> for Document {
    fn from(value: i64) -> Self {
        Document::Integer(value)
    }
}

impl From<u64> for Document {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Document::UInteger(value), Document::Integer)
    }
}

impl From<i32> for Document {
    fn from(value: i32) -> Self {
        Document::Integer(value.into())
    }
}

impl From<u32> for Document {
    fn from(value: u32) -> Self {
        Document::Integer(value.into())
    }
}

impl From<u16> for Document {
    fn from(value: u16) -> Self {
        Document::Integer(value.into())
    }
}

impl From<u8> for Document {
    fn from(value: u8) -> Self {
        Document::Integer(value.into())
    }
}

impl From<f64> for Document {
    fn from(value: f64) -> Self {
        Document::Float(value)
    }
}

impl From<f32> for Document {
    fn from(value: f32) -> Self {
        Document::Float32(value)
    }
}

impl From<&str> for Document {
    fn from(value: &str) -> Self {
        Document::String(value.to_string())
    }
}

impl From<String> for Document {
    fn from(value: String) -> Self {
        Document::String(value)
    }
}

impl<T: Into<Document>> From<Vec<T>> for Document {
    fn from(items: Vec<T>) -> Self {
        Document::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Document>> From<Option<T>> for Document {
    fn from(value: Option<T>) -> Self {
        value.map_or(Document::Nil, Into::into)
    }
}

impl From<BTreeMap<String, Document>> for Document {
    fn from(map: BTreeMap<String, Document>) -> Self {
        Document::Map(map)
    }
}

impl<K: Into<String>, V: Into<Document>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Document::Map(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ============================================================================
// Serde
// ============================================================================

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Document::Nil => serializer.serialize_unit(),
            Document::Bool(b) => serializer.serialize_bool(*b),
            Document::Integer(i) => serializer.serialize_i64(*i),
            Document::UInteger(u) => serializer.serialize_u64(*u),
            Document::Float(f) => serializer.serialize_f64(*f),
            Document::Float32(f) => serializer.serialize_f32(*f),
            Document::String(s) => serializer.serialize_str(s),
            Document::Binary(bytes) => serializer.serialize_bytes(bytes),
            Document::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Document::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = Document;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a msgpack value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Document, E> {
        Ok(Document::Nil)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Document, E> {
        Ok(Document::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Document, D::Error> {
        Document::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Document, E> {
        Ok(Document::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Document, E> {
        Ok(Document::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Document, E> {
        Ok(Document::from(v))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> std::result::Result<Document, E> {
        Ok(Document::Float32(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Document, E> {
        Ok(Document::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Document, E> {
        Ok(Document::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Document, E> {
        Ok(Document::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Document, E> {
        Ok(Document::Binary(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Document, E> {
        Ok(Document::Binary(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Document, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Document::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Document, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Document>()? {
            map.insert(key, value);
        }
        Ok(Document::Map(map))
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(DocumentVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        let nested: Document = [
            ("flag", Document::from(true)),
            ("count", Document::from(-42i64)),
            ("ratio", Document::from(0.25f64)),
            ("gain", Document::from(0.5f32)),
            ("huge", Document::from(u64::MAX)),
            ("label", Document::from("XCBR1")),
            ("blob", Document::Binary(vec![0x01, 0x0c, 0xcd])),
            ("nothing", Document::Nil),
        ]
        .into_iter()
        .collect();

        [
            ("id", Document::from("abc")),
            ("items", Document::from(vec![nested.clone(), Document::from(7i64)])),
            ("inner", nested),
            ("big", Document::from(i64::MAX)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_msgpack_roundtrip_nested() {
        let doc = sample();
        let bytes = doc.to_msgpack().unwrap();
        let back = Document::from_msgpack(&bytes).unwrap();
        assert_eq!(back, doc);

        // Re-encoding the decoded value is byte-identical.
        assert_eq!(back.to_msgpack().unwrap(), bytes);
    }

    #[test]
    fn test_u64_above_i64_max_round_trips() {
        let bytes: Vec<u8> = [0x81, 0xa1, b'v', 0xcf]
            .into_iter()
            .chain([0xff; 8])
            .collect();
        let doc = Document::from_msgpack(&bytes).unwrap();
        assert_eq!(doc.get("v"), Some(&Document::UInteger(u64::MAX)));
        assert_eq!(doc.get("v").and_then(Document::as_u64), Some(u64::MAX));
        assert_eq!(doc.get("v").and_then(Document::as_i64), None);
        assert_eq!(doc.to_msgpack().unwrap(), bytes);

        // Values that fit stay plain integers.
        assert_eq!(Document::from(7u64), Document::Integer(7));
    }

    #[test]
    fn test_float32_keeps_its_width() {
        let bytes = [0x81, 0xa1, b'v', 0xca, 0x3f, 0xc0, 0x00, 0x00];
        let doc = Document::from_msgpack(&bytes).unwrap();
        assert_eq!(doc.get("v"), Some(&Document::Float32(1.5)));
        assert_eq!(doc.get("v").and_then(Document::as_f64), Some(1.5));
        assert_eq!(doc.to_msgpack().unwrap(), bytes);

        let double = [0x81, 0xa1, b'v', 0xcb, 0x3f, 0xf8, 0, 0, 0, 0, 0, 0];
        let doc = Document::from_msgpack(&double).unwrap();
        assert_eq!(doc.get("v"), Some(&Document::Float(1.5)));
        assert_eq!(doc.to_msgpack().unwrap(), double);
    }

    #[test]
    fn test_decode_rejects_empty_and_truncated_input() {
        assert!(Document::from_msgpack(&[]).is_err());

        let bytes = sample().to_msgpack().unwrap();
        assert!(Document::from_msgpack(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_json_interop() {
        let doc: Document = serde_json::from_value(json!({
            "instance_id": "a",
            "port": 102,
            "values": [1.5, null, false]
        }))
        .unwrap();

        assert_eq!(doc.str_field("instance_id"), Some("a"));
        assert_eq!(doc.get("port").and_then(Document::as_i64), Some(102));
        let values = doc.get("values").and_then(Document::as_array).unwrap();
        assert_eq!(values[0].as_f64(), Some(1.5));
        assert!(values[1].is_nil());
        assert_eq!(values[2].as_bool(), Some(false));
    }

    #[test]
    fn test_field_treats_nil_as_absent() {
        let doc: Document = [("value", Document::Nil)].into_iter().collect();
        assert!(doc.get("value").is_some());
        assert!(doc.field("value").is_none());
        assert!(Document::from(3i64).get("value").is_none());
    }
}
