//! Shared IPC protocol types and framing.
//!
//! Defines the wire format for local IPC: 4-byte big-endian length prefix
//! followed by one msgpack envelope document.
//!
//! ```text
//! [u32 BE: len][msgpack bytes of len]
//! ```
//!
//! Request envelope: `{id, type: "request", action, payload?}`.
//! Response envelope: `{id, type: "response", payload, error: {message} | nil}`.

use crate::config::IpcConfig;
use crate::document::Document;
use crate::{Result, SimError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Envelope direction, carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        }
    }
}

/// A decoded request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub kind: MessageKind,
    pub action: String,
    pub payload: Option<Document>,
}

impl Request {
    /// Create a new request.
    pub fn new(id: impl Into<String>, action: impl Into<String>, payload: Document) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Request,
            action: action.into(),
            payload: Some(payload),
        }
    }

    /// Decode a request from msgpack bytes.
    ///
    /// Missing `id`/`action` decode as empty strings; the router turns an
    /// empty action into "Unknown action".
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_document(Document::from_msgpack(bytes)?)
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        let root_kind = doc.kind();
        let Document::Map(mut map) = doc else {
            return Err(SimError::Codec {
                message: format!("request root must be a map, got {}", root_kind),
            });
        };

        let id = take_string(&mut map, "id");
        let action = take_string(&mut map, "action");
        let kind = match map.get("type").and_then(Document::as_str) {
            Some("response") => MessageKind::Response,
            _ => MessageKind::Request,
        };
        let payload = map.remove("payload").filter(|p| !p.is_nil());

        Ok(Self {
            id,
            kind,
            action,
            payload,
        })
    }

    pub fn to_document(&self) -> Document {
        let mut doc: Document = [
            ("id", Document::from(self.id.as_str())),
            ("type", Document::from(self.kind.as_str())),
            ("action", Document::from(self.action.as_str())),
        ]
        .into_iter()
        .collect();
        if let Some(payload) = &self.payload {
            doc.insert("payload", payload.clone());
        }
        doc
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_document().to_msgpack()
    }
}

/// A response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub payload: Document,
    pub error: Option<String>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: impl Into<String>, payload: Document) -> Self {
        Self {
            id: id.into(),
            payload,
            error: None,
        }
    }

    /// Create an error response with an empty payload.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Document::empty_map(),
            error: Some(message.into()),
        }
    }

    /// Response for bytes that could not be decoded into a request.
    pub fn decode_error(message: impl std::fmt::Display) -> Self {
        Self::failure("", format!("Decode error: {}", message))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_document(&self) -> Document {
        let error = match &self.error {
            Some(message) => [("message", message.as_str())].into_iter().collect(),
            None => Document::Nil,
        };
        [
            ("id", Document::from(self.id.as_str())),
            ("type", Document::from(MessageKind::Response.as_str())),
            ("payload", self.payload.clone()),
            ("error", error),
        ]
        .into_iter()
        .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_document().to_msgpack()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Document::Map(mut map) = Document::from_msgpack(bytes)? else {
            return Err(SimError::Codec {
                message: "response root must be a map".to_string(),
            });
        };

        let id = take_string(&mut map, "id");
        let payload = map.remove("payload").unwrap_or(Document::Nil);
        let error = match map.remove("error") {
            Some(Document::String(message)) => Some(message),
            Some(err @ Document::Map(_)) => Some(
                err.str_field("message")
                    .unwrap_or("Unknown error")
                    .to_string(),
            ),
            _ => None,
        };

        Ok(Self { id, payload, error })
    }
}

fn take_string(map: &mut std::collections::BTreeMap<String, Document>, key: &str) -> String {
    match map.remove(key) {
        Some(Document::String(s)) => s,
        _ => String::new(),
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_FRAME_SIZE {
        return Err(SimError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > IpcConfig::MAX_FRAME_SIZE {
        return Err(SimError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                payload.len(),
                IpcConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}
