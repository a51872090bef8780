//! Reaction aggregation on a single message.
//!
//! A [`ReactionSet`] is an insertion-ordered set of `(user, emoji)` pairs.
//! Adding an existing pair and removing an absent one are both no-ops, so
//! optimistic local toggles and their server echoes can be applied in any
//! interleaving without double counting.

use huddle_proto::event::WireReaction;
use huddle_proto::ids::UserId;

/// A single reaction on a message.
pub type Reaction = WireReaction;

/// Reactions grouped by emoji for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    /// The emoji shared by every reaction in the group.
    pub emoji: String,
    /// Number of distinct users who reacted with it.
    pub count: usize,
    /// Reacting users, in the order they reacted.
    pub user_ids: Vec<UserId>,
    /// Whether the local user is among them.
    pub has_mine: bool,
}

/// Insertion-ordered set of reactions keyed by `(user_id, emoji)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionSet {
    entries: Vec<Reaction>,
}

impl ReactionSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builds a set from wire reactions, dropping duplicate pairs.
    #[must_use]
    pub fn from_wire(reactions: Vec<WireReaction>) -> Self {
        let mut set = Self::new();
        for reaction in reactions {
            set.add(reaction);
        }
        set
    }

    /// Adds a reaction. Returns `false` if the pair was already present.
    pub fn add(&mut self, reaction: Reaction) -> bool {
        if self.contains(reaction.user_id, &reaction.emoji) {
            return false;
        }
        self.entries.push(reaction);
        true
    }

    /// Removes a reaction. Returns `false` if the pair was absent.
    pub fn remove(&mut self, user_id: UserId, emoji: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        self.entries.len() != before
    }

    /// Whether `user_id` reacted with `emoji`.
    #[must_use]
    pub fn contains(&self, user_id: UserId, emoji: &str) -> bool {
        self.entries
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
    }

    /// Number of `(user, emoji)` pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates reactions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Reaction> {
        self.entries.iter()
    }

    /// Groups reactions by emoji, ordered by each emoji's first appearance.
    #[must_use]
    pub fn group_for_display(&self, me: UserId) -> Vec<ReactionGroup> {
        let mut groups: Vec<ReactionGroup> = Vec::new();
        for reaction in &self.entries {
            if let Some(group) = groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
                group.count += 1;
                group.user_ids.push(reaction.user_id);
                group.has_mine |= reaction.user_id == me;
            } else {
                groups.push(ReactionGroup {
                    emoji: reaction.emoji.clone(),
                    count: 1,
                    user_ids: vec![reaction.user_id],
                    has_mine: reaction.user_id == me,
                });
            }
        }
        groups
    }
}
