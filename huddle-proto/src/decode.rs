//! Pure decoding of inbound frames into [`ServerEvent`]s.
//!
//! Decoding never has side effects: a malformed frame produces a
//! [`DecodeError`] that the caller logs and drops, and the connection keeps
//! running.

use serde_json::Value;

use crate::event::ServerEvent;

/// Why an inbound frame could not be turned into a [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not valid UTF-8 JSON.
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),
    /// The frame is JSON but has no string `type` discriminator.
    #[error("frame has no string `type` field")]
    MissingType,
    /// The `type` discriminator names an event this client does not know.
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),
    /// A known kind with missing or mistyped fields.
    #[error("invalid `{kind}` event: {reason}")]
    InvalidShape {
        /// The event kind that failed.
        kind: String,
        /// Description of the first offending field.
        reason: String,
    },
}

impl DecodeError {
    /// The event kind involved, when the frame got far enough to name one.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::UnknownKind(kind) | Self::InvalidShape { kind, .. } => Some(kind),
            Self::NotJson(_) | Self::MissingType => None,
        }
    }
}

/// Decodes one text frame.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing why the frame was rejected.
pub fn decode(raw: &str) -> Result<ServerEvent, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::NotJson(e.to_string()))?;
    decode_value(value)
}

/// Decodes one binary frame that carries UTF-8 JSON.
///
/// # Errors
///
/// Returns [`DecodeError::NotJson`] for non-UTF-8 input, otherwise the same
/// errors as [`decode`].
pub fn decode_bytes(raw: &[u8]) -> Result<ServerEvent, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|e| DecodeError::NotJson(e.to_string()))?;
    decode(text)
}

/// Decodes an already parsed JSON value.
///
/// # Errors
///
/// Same as [`decode`], minus [`DecodeError::NotJson`].
pub fn decode_value(value: Value) -> Result<ServerEvent, DecodeError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    if !ServerEvent::KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::InvalidShape {
        kind,
        reason: e.to_string(),
    })
}
