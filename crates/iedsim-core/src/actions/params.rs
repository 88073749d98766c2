//! Payload field extraction shared by the action handlers.

use super::ActionError;
use crate::document::Document;

/// Non-empty `instance_id` of a payload.
pub(crate) fn instance_id(payload: &Document) -> Option<&str> {
    payload.str_field("instance_id").filter(|id| !id.is_empty())
}

/// Optional string field; nil counts as absent.
pub(crate) fn get_str_param<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.field(key).and_then(Document::as_str)
}

/// Optional integer field. Whole floats are accepted.
pub(crate) fn get_i64_param(doc: &Document, key: &str) -> Option<i64> {
    doc.field(key)?.as_whole_i64()
}

/// Optional map field.
pub(crate) fn get_map_param<'a>(doc: &'a Document, key: &str) -> Option<&'a Document> {
    doc.field(key).filter(|value| value.is_map())
}

/// Optional array field.
pub(crate) fn get_array_param<'a>(doc: &'a Document, key: &str) -> Option<&'a [Document]> {
    doc.field(key).and_then(Document::as_array)
}

/// Optional TCP port. Present but out of range is an error.
pub(crate) fn get_port_param(doc: &Document, key: &str) -> Result<Option<u16>, ActionError> {
    match doc.field(key) {
        None => Ok(None),
        Some(_) => get_i64_param(doc, key)
            .and_then(|port| u16::try_from(port).ok())
            .map(Some)
            .ok_or_else(|| ActionError::validation(format!("Invalid {}", key))),
    }
}

pub(crate) const NON_STRING_REFERENCE: &str = "reference must be a string";

/// Key for one entry of a `references` array: the reference itself, or its
/// position (`"[2]"`) when it is not a string.
pub(crate) fn reference_key(index: usize, reference: &Document) -> Result<&str, String> {
    reference.as_str().ok_or_else(|| format!("[{}]", index))
}
