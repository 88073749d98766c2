//! Engine-native attribute values and their document conversions.

use super::types::AttributeType;
use crate::document::Document;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// A typed attribute value as held by the model engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MmsValue {
    Boolean(bool),
    Integer(i64),
    Unsigned(u32),
    Float(f32),
    Double(f64),
    VisibleString(String),
    OctetString(Vec<u8>),
    Quality(u16),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Structure(Vec<MmsValue>),
}

impl MmsValue {
    /// Convert a document into a value of the given attribute type.
    ///
    /// Returns `None` when the document cannot represent that type.
    pub fn from_document(doc: &Document, ty: AttributeType) -> Option<Self> {
        if let Some((min, max)) = ty.signed_range() {
            return integer_of(doc)
                .filter(|i| (min..=max).contains(i))
                .map(MmsValue::Integer);
        }
        if let Some(max) = ty.unsigned_max() {
            return integer_of(doc)
                .and_then(|i| u32::try_from(i).ok())
                .filter(|u| *u <= max)
                .map(MmsValue::Unsigned);
        }
        if ty.is_string() {
            return doc.as_str().map(|s| MmsValue::VisibleString(s.to_string()));
        }

        match ty {
            AttributeType::Boolean => match doc {
                Document::Bool(b) => Some(MmsValue::Boolean(*b)),
                Document::Integer(i) => Some(MmsValue::Boolean(*i != 0)),
                _ => None,
            },
            AttributeType::Float32 => doc.as_f64().map(|f| MmsValue::Float(f as f32)),
            AttributeType::Float64 => doc.as_f64().map(MmsValue::Double),
            AttributeType::OctetString64 => match doc {
                Document::Binary(bytes) => Some(MmsValue::OctetString(bytes.clone())),
                Document::String(s) => hex::decode(s).ok().map(MmsValue::OctetString),
                _ => None,
            },
            AttributeType::Quality => integer_of(doc)
                .and_then(|i| u16::try_from(i).ok())
                .map(MmsValue::Quality),
            AttributeType::Timestamp => match doc {
                Document::Integer(ms) => Some(MmsValue::Timestamp(*ms)),
                Document::String(s) => parse_timestamp(s).map(MmsValue::Timestamp),
                _ => None,
            },
            _ => None,
        }
    }

    /// Value for an untyped write, chosen by the document's own kind.
    pub fn from_untyped(doc: &Document) -> Option<Self> {
        match doc {
            Document::Bool(b) => Some(MmsValue::Boolean(*b)),
            Document::Float(f) => Some(MmsValue::Float(*f as f32)),
            Document::Float32(f) => Some(MmsValue::Float(*f)),
            Document::Integer(i) => Some(MmsValue::Integer(*i)),
            Document::String(s) => Some(MmsValue::VisibleString(s.clone())),
            Document::Binary(bytes) => Some(MmsValue::OctetString(bytes.clone())),
            _ => None,
        }
    }

    pub fn to_document(&self) -> Document {
        match self {
            MmsValue::Boolean(b) => Document::Bool(*b),
            MmsValue::Integer(i) => Document::Integer(*i),
            MmsValue::Unsigned(u) => Document::Integer((*u).into()),
            MmsValue::Float(f) => Document::Float((*f).into()),
            MmsValue::Double(d) => Document::Float(*d),
            MmsValue::VisibleString(s) => Document::String(s.clone()),
            MmsValue::OctetString(bytes) => Document::String(hex::encode(bytes)),
            MmsValue::Quality(q) => Document::Integer((*q).into()),
            MmsValue::Timestamp(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .map(|dt| Document::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .unwrap_or(Document::Integer(*ms)),
            MmsValue::Structure(items) => {
                Document::Array(items.iter().map(MmsValue::to_document).collect())
            }
        }
    }
}

fn integer_of(doc: &Document) -> Option<i64> {
    match doc {
        Document::Bool(b) => Some(i64::from(*b)),
        other => other.as_whole_i64(),
    }
}

fn parse_timestamp(text: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis())
}
