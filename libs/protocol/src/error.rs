//! Protocol decode errors.

use thiserror::Error;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The text was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame has no `type` field, or it is not a string.
    #[error("frame missing 'type' field")]
    MissingType,

    /// The `type` value is not part of either dialect.
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// The payload did not match the shape required by the message type.
    #[error("invalid payload for '{kind}': {message}")]
    InvalidPayload { kind: String, message: String },
}

impl ProtocolError {
    pub(crate) fn invalid_payload(kind: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}
