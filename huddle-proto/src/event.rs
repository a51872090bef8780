//! Server-pushed event types.
//!
//! Every frame the server pushes over the realtime connection is one
//! variant of [`ServerEvent`], discriminated by its `type` field. The set is
//! closed: downstream code matches exhaustively, so a new event kind is a
//! compile-time change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ChannelId, DocumentId, MessageId, UserId};

/// A reaction as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReaction {
    /// The reacting user.
    pub user_id: UserId,
    /// The emoji, as the literal grapheme or shortcode.
    pub emoji: String,
    /// Display username of the reacting user.
    #[serde(default)]
    pub username: String,
    /// Optional avatar for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A chat message body, shared by `new_message` events and REST history pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server-assigned id, monotonic within the channel.
    pub id: MessageId,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Author of the message.
    pub user_id: UserId,
    /// Message text.
    pub content: String,
    /// Creation time as recorded by the server.
    pub created_at: DateTime<Utc>,
    /// Parent message when this is a threaded reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    /// Document attached to (shared through) this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    /// Reactions already present on the message.
    #[serde(default)]
    pub reactions: Vec<WireReaction>,
    /// Author's username, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Number of replies, present on history pages.
    #[serde(default)]
    pub reply_count: u32,
    /// Correlation nonce echoed from the client's send frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<Uuid>,
}

/// Global presence status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// User has at least one live session.
    Online,
    /// User has no live session.
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// The closed set of events the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was posted (including the echo of our own sends).
    NewMessage(WireMessage),
    /// A message was deleted.
    MessageDeleted {
        /// The deleted message.
        message_id: MessageId,
    },
    /// A reaction was added to a message.
    ReactionAdded {
        /// Target message.
        message_id: MessageId,
        /// The added reaction.
        reaction: WireReaction,
    },
    /// A reaction was removed from a message.
    ReactionRemoved {
        /// Target message.
        message_id: MessageId,
        /// User whose reaction was removed.
        user_id: UserId,
        /// Removed emoji.
        emoji: String,
    },
    /// A user started or stopped typing.
    Typing {
        /// The typing user.
        user_id: UserId,
        /// Display name.
        #[serde(default)]
        full_name: String,
        /// Username, used when no full name is set.
        #[serde(default)]
        username: String,
        /// `true` while typing, `false` once stopped.
        is_typing: bool,
        /// Channel scope; absent means the currently open channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
    },
    /// Aggregate online count for a channel.
    Presence {
        /// Number of channel members currently online.
        online_count: u32,
        /// Channel scope; absent means the currently open channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
    },
    /// An individual user went online or offline.
    UserPresence {
        /// The user whose status changed.
        user_id: UserId,
        /// The new status.
        status: PresenceStatus,
        /// When the user was last seen (for offline transitions).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    /// A user read a channel up to a message.
    ReadReceipt {
        /// The channel that was read.
        channel_id: ChannelId,
        /// The reader.
        user_id: UserId,
        /// Last message id the reader has seen.
        last_read_id: MessageId,
    },
    /// A document was shared into a channel.
    DocumentShared {
        /// The shared document.
        document_id: DocumentId,
        /// Channel it was shared through.
        channel_id: ChannelId,
        /// Who shared it.
        sender_id: UserId,
    },
}

impl ServerEvent {
    /// Every `type` discriminator this client understands.
    pub const KINDS: [&'static str; 9] = [
        "new_message",
        "message_deleted",
        "reaction_added",
        "reaction_removed",
        "typing",
        "presence",
        "user_presence",
        "read_receipt",
        "document_shared",
    ];

    /// The wire discriminator of this event.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::UserPresence { .. } => "user_presence",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::DocumentShared { .. } => "document_shared",
        }
    }
}
