//! Client-to-server frames sent over the realtime connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ChannelId, MessageId};

/// Error type for encoding outbound frames.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A frame the client pushes to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Post a message to a channel.
    Message {
        /// Destination channel.
        channel_id: ChannelId,
        /// Message text.
        content: String,
        /// Parent message for threaded replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<MessageId>,
        /// Correlation nonce the server echoes on the resulting `new_message`.
        client_nonce: Uuid,
    },
    /// Start or stop the local user's typing indicator.
    Typing {
        /// Channel being typed in.
        channel_id: ChannelId,
        /// Whether the user is currently typing.
        is_typing: bool,
    },
}

impl ClientFrame {
    /// The channel this frame targets.
    #[must_use]
    pub const fn channel_id(&self) -> ChannelId {
        match self {
            Self::Message { channel_id, .. } | Self::Typing { channel_id, .. } => *channel_id,
        }
    }
}

/// Encodes a frame as a JSON text payload.
///
/// # Errors
///
/// Returns [`EncodeError::Serialization`] if the frame cannot be serialized.
pub fn encode(frame: &ClientFrame) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(frame)?)
}
