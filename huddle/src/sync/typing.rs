//! "Who is typing" state with deadline-based expiry.
//!
//! Entries live in one arena keyed by `(channel, user)` and carry their own
//! deadline. A single periodic [`TypingAggregator::sweep`] removes expired
//! entries; queries also filter by deadline, so an entry is never reported
//! past its expiry even if the sweep has not run yet.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use huddle_proto::ids::{ChannelId, UserId};

/// Default time a typing signal stays valid without a refresh.
pub const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct TypingEntry {
    display_name: String,
    deadline: Instant,
}

/// A user currently typing in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typist {
    /// The typing user.
    pub user_id: UserId,
    /// Name to show.
    pub display_name: String,
}

/// Per-channel set of typing users.
#[derive(Debug)]
pub struct TypingAggregator {
    me: UserId,
    expiry: Duration,
    entries: HashMap<(ChannelId, UserId), TypingEntry>,
}

impl TypingAggregator {
    /// Creates an aggregator that ignores signals from `me`.
    #[must_use]
    pub fn new(me: UserId, expiry: Duration) -> Self {
        Self {
            me,
            expiry,
            entries: HashMap::new(),
        }
    }

    /// Applies a typing signal. Returns whether the visible set changed.
    pub fn signal(
        &mut self,
        channel_id: ChannelId,
        user_id: UserId,
        display_name: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if user_id == self.me {
            return false;
        }
        let key = (channel_id, user_id);
        if is_typing {
            let deadline = now + self.expiry;
            let previous = self.entries.insert(
                key,
                TypingEntry {
                    display_name: display_name.to_string(),
                    deadline,
                },
            );
            // A refresh of a live entry only moves its deadline.
            !previous.is_some_and(|p| p.deadline > now && p.display_name == display_name)
        } else {
            self.entries
                .remove(&key)
                .is_some_and(|p| p.deadline > now)
        }
    }

    /// Removes expired entries. Returns the channels whose set changed.
    pub fn sweep(&mut self, now: Instant) -> Vec<ChannelId> {
        let mut changed: Vec<ChannelId> = Vec::new();
        self.entries.retain(|(channel_id, _), entry| {
            let live = entry.deadline > now;
            if !live && !changed.contains(channel_id) {
                changed.push(*channel_id);
            }
            live
        });
        changed.sort_unstable();
        changed
    }

    /// Users typing in `channel_id` at `now`, ordered by user id.
    #[must_use]
    pub fn typing_in(&self, channel_id: ChannelId, now: Instant) -> Vec<Typist> {
        let mut typists: Vec<Typist> = self
            .entries
            .iter()
            .filter(|((ch, _), entry)| *ch == channel_id && entry.deadline > now)
            .map(|((_, user_id), entry)| Typist {
                user_id: *user_id,
                display_name: entry.display_name.clone(),
            })
            .collect();
        typists.sort_by_key(|t| t.user_id);
        typists
    }

    /// Drops every entry of a channel. Returns whether anything was removed.
    pub fn clear_channel(&mut self, channel_id: ChannelId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(ch, _), _| *ch != channel_id);
        self.entries.len() != before
    }

    /// Drops all state (used after a reconnect).
    pub fn clear_all(&mut self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.entries.keys().map(|(ch, _)| *ch).collect();
        channels.sort_unstable();
        channels.dedup();
        self.entries.clear();
        channels
    }
}
