//! Error types for the simulator backend.
//!
//! `SimError` covers infrastructure failures (sockets, codec, engine setup).
//! Failures that are reported back to the caller inside a response envelope
//! use [`ActionError`](crate::actions::ActionError) instead.

use thiserror::Error;

/// Main error type for the simulator backend.
#[derive(Debug, Error)]
pub enum SimError {
    // File system / socket errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("Codec error: {message}")]
    Codec { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Model engine errors
    #[error("Engine error: {message}")]
    Engine { message: String },

    // Host network configuration errors
    #[error("Network error: {message}")]
    Network { message: String },

    // Listener / worker pool errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for simulator operations.
pub type Result<T> = std::result::Result<T, SimError>;

impl From<std::io::Error> for SimError {
    fn from(err: std::io::Error) -> Self {
        SimError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rmp_serde::decode::Error> for SimError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        SimError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for SimError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        SimError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<crate::engine::EngineError> for SimError {
    fn from(err: crate::engine::EngineError) -> Self {
        SimError::Engine {
            message: err.to_string(),
        }
    }
}

impl SimError {
    /// Whether the error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SimError::Io {
                source: Some(err), ..
            } => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SimError::Validation {
            field: "ipc_frame".into(),
            message: "too large".into(),
        };
        assert_eq!(err.to_string(), "Validation error for ipc_frame: too large");
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: SimError = io.into();
        assert!(err.is_disconnect());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_engine_error_keeps_native_text() {
        let err: SimError = crate::engine::EngineError::AddressInUse.into();
        assert_eq!(err.to_string(), "Engine error: Address already in use");
        assert!(!err.is_disconnect());
    }

    #[test]
    fn test_codec_error_is_not_disconnect() {
        let err = SimError::Codec {
            message: "bad marker".into(),
        };
        assert!(!err.is_disconnect());
    }
}
