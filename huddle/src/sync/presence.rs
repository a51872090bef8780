//! Global online set and per-user last-seen timestamps.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use huddle_proto::ids::UserId;

/// Tracks which users are online across the whole workspace.
///
/// Channel-scoped counts are not stored here; they are derived by
/// intersecting a member list with the online set, see
/// [`PresenceTracker::online_among`].
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
    last_seen: HashMap<UserId, DateTime<Utc>>,
}

impl PresenceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a user online. Returns whether the state changed.
    pub fn set_online(&mut self, user_id: UserId) -> bool {
        self.online.insert(user_id)
    }

    /// Marks a user offline and records when they were last seen.
    ///
    /// An older timestamp never overwrites a newer one.
    pub fn set_offline(&mut self, user_id: UserId, last_seen: DateTime<Utc>) -> bool {
        let was_online = self.online.remove(&user_id);
        self.last_seen
            .entry(user_id)
            .and_modify(|seen| *seen = (*seen).max(last_seen))
            .or_insert(last_seen);
        was_online
    }

    /// Empties the online set, returning who was in it (sorted). Last-seen
    /// times are kept.
    pub fn forget_online(&mut self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.drain().collect();
        users.sort_unstable();
        users
    }

    /// Whether the user is online.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.online.contains(&user_id)
    }

    /// When the user was last seen going offline.
    #[must_use]
    pub fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.last_seen.get(&user_id).copied()
    }

    /// Number of `members` currently online.
    pub fn online_among<'a>(&self, members: impl IntoIterator<Item = &'a UserId>) -> u32 {
        let count = members
            .into_iter()
            .filter(|user_id| self.online.contains(user_id))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Number of users online overall.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}
