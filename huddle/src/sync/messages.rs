//! Per-channel message log with optimistic sends and echo reconciliation.
//!
//! Each channel keeps its server-confirmed messages in a `BTreeMap` keyed by
//! id, so every merge path (live event, backfill page, reconnect refresh)
//! reduces to `dedupe-by-id(sort-by-id(existing ∪ incoming))`. Messages
//! sent locally live in a separate pending list, rendered after the
//! confirmed ones, until the server echo replaces them.
//!
//! A reconnect refresh can land a newest page that does not reach the
//! messages already loaded. The store then records a gap below that page
//! and older-history requests fill it before going further back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use huddle_proto::event::WireMessage;
use huddle_proto::ids::{ChannelId, DocumentId, MessageId, UserId};

use super::reactions::ReactionSet;

/// Delivery state of a locally sent message that the server has not echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Handed to the connection; waiting for the echo.
    Sending,
    /// The connection rejected the send. Kept until the user retries.
    Failed,
}

/// Whether a stored message is server-confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Carries a permanent server id.
    Confirmed,
    /// Carries a temporary id and awaits the server echo.
    Pending(SendState),
}

/// A message as held in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server id, or a negative temporary id while pending.
    pub id: MessageId,
    /// Owning channel.
    pub channel_id: ChannelId,
    /// Author.
    pub author_id: UserId,
    /// Author's username, if known.
    pub author_name: Option<String>,
    /// Message text.
    pub body: String,
    /// Server creation time, or local send time while pending.
    pub created_at: DateTime<Utc>,
    /// Parent message for threaded replies.
    pub parent_id: Option<MessageId>,
    /// Shared document reference.
    pub document_id: Option<DocumentId>,
    /// Number of replies to this message.
    pub reply_count: u32,
    /// Reactions on this message.
    pub reactions: ReactionSet,
    /// Confirmation state.
    pub delivery: Delivery,
}

impl Message {
    /// Whether the message still awaits its server echo.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending(_))
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            id: wire.id,
            channel_id: wire.channel_id,
            author_id: wire.user_id,
            author_name: wire.username,
            body: wire.content,
            created_at: wire.created_at,
            parent_id: wire.parent_id,
            document_id: wire.document_id,
            reply_count: wire.reply_count,
            reactions: ReactionSet::from_wire(wire.reactions),
            delivery: Delivery::Confirmed,
        }
    }
}

/// Result of applying one server message to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Stored as a new message.
    Inserted,
    /// Replaced the pending optimistic entry with this temporary id.
    Reconciled {
        /// The temporary id that was retired.
        temp_id: MessageId,
    },
    /// A message with this id was already stored; nothing changed.
    Duplicate,
}

impl Applied {
    /// Whether the store changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// What a page merge did, so callers can keep the user's scroll anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Visible message count before the merge.
    pub old_len: usize,
    /// Visible message count after the merge.
    pub new_len: usize,
    /// Number of messages that were not already stored.
    pub inserted: usize,
    /// Whether older history is exhausted for this channel.
    pub exhausted: bool,
}

/// A freshly inserted optimistic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticSend {
    /// Temporary id assigned to the message.
    pub temp_id: MessageId,
    /// Nonce to put on the outbound frame for exact echo matching.
    pub nonce: Uuid,
}

/// Data needed to re-send a pending message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPayload {
    /// Destination channel.
    pub channel_id: ChannelId,
    /// Message text.
    pub content: String,
    /// Parent for replies.
    pub parent_id: Option<MessageId>,
    /// Original nonce.
    pub nonce: Uuid,
}

#[derive(Debug)]
struct PendingEntry {
    message: Message,
    nonce: Uuid,
    sent_at: Instant,
    sent_wall: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ChannelLog {
    confirmed: BTreeMap<MessageId, Message>,
    pending: Vec<PendingEntry>,
    exhausted: bool,
    /// Oldest id of each loaded run that has unloaded history directly
    /// below it. Only the highest one is filled; the runs above it are
    /// contiguous with the server's newest message.
    gaps: BTreeSet<MessageId>,
}

impl ChannelLog {
    fn visible_len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    /// Server offset of the next older page: how many messages sit above
    /// the bottom of the contiguous newest run.
    fn backfill_offset(&self) -> usize {
        self.gaps
            .last()
            .map_or(self.confirmed.len(), |floor| self.confirmed.range(floor..).count())
    }

    fn newest_below(&self, floor: MessageId) -> Option<MessageId> {
        self.confirmed.range(..floor).next_back().map(|(id, _)| *id)
    }
}

/// Where a confirmed message came from. Only live events may consume a
/// pending entry without a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Live,
    History,
}

/// Owned store of every loaded channel's messages.
#[derive(Debug)]
pub struct MessageStore {
    me: UserId,
    echo_window: Duration,
    channels: HashMap<ChannelId, ChannelLog>,
    /// Where each stored id (confirmed or temporary) lives.
    index: HashMap<MessageId, ChannelId>,
    next_temp: i64,
}

impl MessageStore {
    /// Creates an empty store for the session user `me`.
    ///
    /// A live echo of one of our own messages without a nonce is matched to
    /// a pending entry only if both its arrival and its server timestamp
    /// are within `echo_window` of the send.
    #[must_use]
    pub fn new(me: UserId, echo_window: Duration) -> Self {
        Self {
            me,
            echo_window,
            channels: HashMap::new(),
            index: HashMap::new(),
            next_temp: -1,
        }
    }

    /// Inserts a locally composed message immediately, with a temporary id.
    pub fn apply_optimistic_send(
        &mut self,
        channel_id: ChannelId,
        content: String,
        parent_id: Option<MessageId>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> OptimisticSend {
        let temp_id = MessageId(self.next_temp);
        self.next_temp -= 1;
        let nonce = Uuid::now_v7();

        let message = Message {
            id: temp_id,
            channel_id,
            author_id: self.me,
            author_name: None,
            body: content,
            created_at: wall,
            parent_id,
            document_id: None,
            reply_count: 0,
            reactions: ReactionSet::new(),
            delivery: Delivery::Pending(SendState::Sending),
        };
        self.channels
            .entry(channel_id)
            .or_default()
            .pending
            .push(PendingEntry {
                message,
                nonce,
                sent_at: now,
                sent_wall: wall,
            });
        self.index.insert(temp_id, channel_id);

        tracing::debug!(channel_id = %channel_id, temp_id = %temp_id, "optimistic message inserted");
        OptimisticSend { temp_id, nonce }
    }

    /// Marks a pending message as not delivered. Returns `false` if unknown.
    pub fn mark_send_failed(&mut self, temp_id: MessageId) -> bool {
        self.pending_entry_mut(temp_id).is_some_and(|entry| {
            entry.message.delivery = Delivery::Pending(SendState::Failed);
            true
        })
    }

    /// Flags a pending message as being sent again and returns what to send.
    pub fn prepare_retry(
        &mut self,
        temp_id: MessageId,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Option<RetryPayload> {
        let entry = self.pending_entry_mut(temp_id)?;
        entry.message.delivery = Delivery::Pending(SendState::Sending);
        entry.sent_at = now;
        entry.sent_wall = wall;
        Some(RetryPayload {
            channel_id: entry.message.channel_id,
            content: entry.message.body.clone(),
            parent_id: entry.message.parent_id,
            nonce: entry.nonce,
        })
    }

    /// Applies a live `new_message` event.
    ///
    /// Our own echo replaces its pending entry; anything else is inserted
    /// unless the id is already stored. Newly stored replies bump their
    /// parent's reply count.
    pub fn reconcile_server_message(&mut self, wire: WireMessage, now: Instant) -> Applied {
        let parent_id = wire.parent_id;
        let applied = self.insert_confirmed(wire, now, Arrival::Live);
        if applied.changed()
            && let Some(parent) = parent_id
        {
            self.append_reply(parent);
        }
        applied
    }

    /// Merges an older history page (backfill), fetched at
    /// [`backfill_offset`](Self::backfill_offset). Short pages mark the
    /// channel's history as exhausted.
    ///
    /// While a gap is open the page extends the run above it; once the page
    /// reaches the messages below the gap, the gap is closed.
    pub fn merge_page(
        &mut self,
        channel_id: ChannelId,
        page: Vec<WireMessage>,
        page_size: usize,
        now: Instant,
    ) -> MergeOutcome {
        let short = page.len() < page_size;
        let page_oldest = oldest_in(&page, channel_id);
        let open_gap = self.channels.get(&channel_id).and_then(|log| {
            let floor = log.gaps.last().copied()?;
            Some((floor, log.newest_below(floor)))
        });
        let mut outcome = self.merge_into(channel_id, page, now);

        let log = self.channels.entry(channel_id).or_default();
        if short {
            log.exhausted = true;
            log.gaps.clear();
            outcome.exhausted = true;
        } else if let Some((floor, below)) = open_gap {
            log.gaps.remove(&floor);
            match (page_oldest, below) {
                (Some(oldest), Some(below)) if oldest > below => {
                    log.gaps.insert(oldest.min(floor));
                }
                (None, Some(_)) => {
                    log.gaps.insert(floor);
                }
                _ => tracing::debug!(channel_id = %channel_id, "history gap closed"),
            }
        }
        outcome
    }

    /// Merges the newest page after a reconnect. Never marks exhaustion.
    ///
    /// A full page whose oldest row is newer than everything loaded leaves
    /// unloaded messages in between; that gap is recorded.
    pub fn merge_latest(
        &mut self,
        channel_id: ChannelId,
        page: Vec<WireMessage>,
        page_size: usize,
        now: Instant,
    ) -> MergeOutcome {
        let full = page.len() >= page_size;
        let page_oldest = oldest_in(&page, channel_id);
        let previous_newest = self.newest_id(channel_id);
        let outcome = self.merge_into(channel_id, page, now);

        if full
            && let (Some(oldest), Some(previous)) = (page_oldest, previous_newest)
            && oldest > previous
        {
            tracing::info!(
                channel_id = %channel_id,
                loaded_up_to = %previous,
                page_starts_at = %oldest,
                "newest page does not reach loaded history, recording gap"
            );
            self.channels
                .entry(channel_id)
                .or_default()
                .gaps
                .insert(oldest);
        }
        outcome
    }

    /// Offset of the next older page for a channel.
    #[must_use]
    pub fn backfill_offset(&self, channel_id: ChannelId) -> usize {
        self.channels
            .get(&channel_id)
            .map_or(0, ChannelLog::backfill_offset)
    }

    /// Whether some history between loaded messages is still missing.
    #[must_use]
    pub fn has_gap(&self, channel_id: ChannelId) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|log| !log.gaps.is_empty())
    }

    /// Removes a message (confirmed or pending). Returns its channel.
    pub fn remove_message(&mut self, id: MessageId) -> Option<ChannelId> {
        let channel_id = self.index.remove(&id)?;
        let log = self.channels.get_mut(&channel_id)?;
        let removed = if let Some(message) = log.confirmed.remove(&id) {
            Some(message)
        } else {
            log.pending
                .iter()
                .position(|p| p.message.id == id)
                .map(|pos| log.pending.remove(pos).message)
        };

        if let Some(parent) = removed.and_then(|m| m.parent_id)
            && let Some(parent_msg) = self.get_mut(parent)
        {
            parent_msg.reply_count = parent_msg.reply_count.saturating_sub(1);
        }
        Some(channel_id)
    }

    /// Increments the reply count of `parent_id`. No-op if not loaded.
    pub fn append_reply(&mut self, parent_id: MessageId) -> bool {
        self.get_mut(parent_id).is_some_and(|parent| {
            parent.reply_count += 1;
            true
        })
    }

    /// Looks up a stored message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        let log = self.channels.get(self.index.get(&id)?)?;
        log.confirmed.get(&id).or_else(|| {
            log.pending
                .iter()
                .find(|p| p.message.id == id)
                .map(|p| &p.message)
        })
    }

    /// Looks up a stored message by id, mutably.
    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let channel_id = *self.index.get(&id)?;
        let log = self.channels.get_mut(&channel_id)?;
        if log.confirmed.contains_key(&id) {
            return log.confirmed.get_mut(&id);
        }
        log.pending
            .iter_mut()
            .find(|p| p.message.id == id)
            .map(|p| &mut p.message)
    }

    /// Messages of a channel in display order: confirmed ascending by id,
    /// then pending in send order.
    #[must_use]
    pub fn messages(&self, channel_id: ChannelId) -> Vec<&Message> {
        self.channels.get(&channel_id).map_or_else(Vec::new, |log| {
            log.confirmed
                .values()
                .chain(log.pending.iter().map(|p| &p.message))
                .collect()
        })
    }

    /// Number of server-confirmed messages loaded for a channel.
    #[must_use]
    pub fn confirmed_len(&self, channel_id: ChannelId) -> usize {
        self.channels
            .get(&channel_id)
            .map_or(0, |log| log.confirmed.len())
    }

    /// Newest confirmed message id in a channel.
    #[must_use]
    pub fn newest_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.channels
            .get(&channel_id)
            .and_then(|log| log.confirmed.keys().next_back().copied())
    }

    /// Oldest confirmed message id in a channel.
    #[must_use]
    pub fn oldest_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.channels
            .get(&channel_id)
            .and_then(|log| log.confirmed.keys().next().copied())
    }

    /// Whether older history for the channel is known to be exhausted.
    #[must_use]
    pub fn is_exhausted(&self, channel_id: ChannelId) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|log| log.exhausted)
    }

    /// Pending messages of a channel, in send order.
    #[must_use]
    pub fn pending(&self, channel_id: ChannelId) -> Vec<&Message> {
        self.channels.get(&channel_id).map_or_else(Vec::new, |log| {
            log.pending.iter().map(|p| &p.message).collect()
        })
    }

    fn merge_into(
        &mut self,
        channel_id: ChannelId,
        page: Vec<WireMessage>,
        now: Instant,
    ) -> MergeOutcome {
        let old_len = self
            .channels
            .get(&channel_id)
            .map_or(0, ChannelLog::visible_len);
        let mut inserted = 0;
        for wire in page {
            if wire.channel_id != channel_id {
                tracing::warn!(
                    expected = %channel_id,
                    got = %wire.channel_id,
                    message_id = %wire.id,
                    "history page contains a message from another channel, skipping"
                );
                continue;
            }
            if self.insert_confirmed(wire, now, Arrival::History).changed() {
                inserted += 1;
            }
        }
        let log = self.channels.entry(channel_id).or_default();
        MergeOutcome {
            old_len,
            new_len: log.visible_len(),
            inserted,
            exhausted: log.exhausted,
        }
    }

    fn insert_confirmed(&mut self, wire: WireMessage, now: Instant, arrival: Arrival) -> Applied {
        let channel_id = wire.channel_id;
        let id = wire.id;
        if self.index.contains_key(&id) {
            return Applied::Duplicate;
        }

        let log = self.channels.entry(channel_id).or_default();
        let mut applied = Applied::Inserted;
        if wire.user_id == self.me {
            let matched = match arrival {
                Arrival::Live => match_pending(&log.pending, &wire, now, self.echo_window),
                Arrival::History => wire
                    .client_nonce
                    .and_then(|nonce| log.pending.iter().position(|p| p.nonce == nonce)),
            };
            if let Some(pos) = matched {
                let entry = log.pending.remove(pos);
                self.index.remove(&entry.message.id);
                applied = Applied::Reconciled {
                    temp_id: entry.message.id,
                };
            } else {
                tracing::debug!(
                    channel_id = %channel_id,
                    message_id = %id,
                    "own message without a matching optimistic entry, inserting as new"
                );
            }
        }

        log.confirmed.insert(id, Message::from(wire));
        self.index.insert(id, channel_id);
        applied
    }

    fn pending_entry_mut(&mut self, temp_id: MessageId) -> Option<&mut PendingEntry> {
        let channel_id = *self.index.get(&temp_id)?;
        self.channels
            .get_mut(&channel_id)?
            .pending
            .iter_mut()
            .find(|p| p.message.id == temp_id)
    }
}

/// Finds the pending entry an echo of our own message belongs to.
///
/// A nonce on the echo must match exactly. Without one, the oldest entry
/// still being sent wins if the echo arrived within `window` of the send
/// and carries a server time within `window` of it, preferring one with
/// identical content. Failed sends are only ever matched by nonce.
fn match_pending(
    pending: &[PendingEntry],
    wire: &WireMessage,
    now: Instant,
    window: Duration,
) -> Option<usize> {
    if let Some(nonce) = wire.client_nonce {
        return pending.iter().position(|p| p.nonce == nonce);
    }

    let skew = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    let in_window = |p: &PendingEntry| {
        p.message.delivery == Delivery::Pending(SendState::Sending)
            && now.saturating_duration_since(p.sent_at) <= window
            && (wire.created_at - p.sent_wall).abs() <= skew
    };
    pending
        .iter()
        .position(|p| in_window(p) && p.message.body == wire.content)
        .or_else(|| pending.iter().position(in_window))
}

fn oldest_in(page: &[WireMessage], channel_id: ChannelId) -> Option<MessageId> {
    page.iter()
        .filter(|m| m.channel_id == channel_id)
        .map(|m| m.id)
        .min()
}
