//! Realtime-relevant channel metadata.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use chrono::{DateTime, Utc};

use huddle_proto::ids::{ChannelId, MessageId, UserId};
use huddle_proto::rest::ChannelSummary;

/// Direct or group conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Two participants.
    Direct,
    /// Any number of participants.
    Group,
}

/// One channel as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub name: String,
    /// Notifications are suppressed until this instant.
    pub mute_until: Option<DateTime<Utc>>,
    /// Our own server-confirmed read position.
    pub last_read_id: Option<MessageId>,
    /// The counterpart's read position (direct channels only).
    pub others_read_id: Option<MessageId>,
    /// Members currently online, derived from presence.
    pub online_count: u32,
    pub members: Vec<UserId>,
    pub pinned: bool,
}

impl From<ChannelSummary> for Channel {
    fn from(summary: ChannelSummary) -> Self {
        Self {
            id: summary.id,
            kind: if summary.is_direct {
                ChannelKind::Direct
            } else {
                ChannelKind::Group
            },
            name: summary.name,
            mute_until: summary.mute_until,
            last_read_id: summary.last_read_message_id,
            others_read_id: summary.others_read_message_id,
            online_count: 0,
            members: summary.member_ids,
            pinned: summary.is_pinned,
        }
    }
}

/// All known channels, ordered by id.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelId, Channel>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a channel from the REST list. The derived
    /// online count is kept; callers re-derive it after membership changes.
    pub fn upsert_from_summary(&mut self, summary: ChannelSummary) -> &mut Channel {
        let id = summary.id;
        let online_count = self.channels.get(&id).map_or(0, |c| c.online_count);
        let channel = Channel {
            online_count,
            ..Channel::from(summary)
        };
        match self.channels.entry(id) {
            Entry::Occupied(mut slot) => {
                slot.insert(channel);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(channel),
        }
    }

    /// Drops channels absent from the latest REST list.
    pub fn retain_ids(&mut self, keep: &[ChannelId]) -> Vec<ChannelId> {
        let removed: Vec<ChannelId> = self
            .channels
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in &removed {
            self.channels.remove(id);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    /// Replaces a channel's member list. Returns `false` for unknown ids.
    pub fn set_members(&mut self, id: ChannelId, members: Vec<UserId>) -> bool {
        self.channels.get_mut(&id).is_some_and(|c| {
            c.members = members;
            true
        })
    }

    /// Pinned channels first, then by id.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        let pinned = self.channels.values().filter(|c| c.pinned);
        let rest = self.channels.values().filter(|c| !c.pinned);
        pinned.chain(rest)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
