//! Request and response bodies of the REST collaborators the sync engine
//! consumes (channel list snapshot, history pages, mark-read, reactions).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, MessageId, UserId};

/// One row of the channel list, including the unread snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Channel id.
    pub id: ChannelId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether this is a two-party direct channel.
    #[serde(default)]
    pub is_direct: bool,
    /// Authoritative unread count at the time of the request.
    #[serde(default)]
    pub unread_count: u32,
    /// Notifications are muted until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_until: Option<DateTime<Utc>>,
    /// Last message the current user has read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<MessageId>,
    /// Last message the counterpart has read (direct channels only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub others_read_message_id: Option<MessageId>,
    /// Whether the user pinned the channel to the top of the list.
    #[serde(default)]
    pub is_pinned: bool,
    /// Current members of the channel.
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

/// Query string of the paginated history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of messages to return.
    pub limit: u32,
    /// Number of newest messages to skip.
    pub offset: u32,
}

/// Response of the mark-as-read endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConfirmation {
    /// The channel marked read.
    pub channel_id: ChannelId,
    /// Latest message id covered by the read mark, if the channel has any.
    #[serde(default)]
    pub last_read_id: Option<MessageId>,
}

/// Body of the add-reaction endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionBody {
    /// Emoji to add or remove.
    pub emoji: String,
}
