//! In-memory chat data: channels, members, messages, reactions and read
//! marks.
//!
//! [`ChatStore`] is the relay's single source of truth. Message ids come
//! from one global counter, so they are monotonic within every channel.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use huddle_proto::event::{WireMessage, WireReaction};
use huddle_proto::ids::{ChannelId, MessageId, UserId};
use huddle_proto::rest::{ChannelSummary, HistoryQuery, ReadConfirmation};

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No channel with this id.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The user is not a member of the channel.
    #[error("user {user} is not a member of channel {channel}")]
    NotMember {
        /// The channel.
        channel: ChannelId,
        /// The user.
        user: UserId,
    },

    /// No message with this id in the channel.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

#[derive(Debug)]
struct ChannelRecord {
    name: String,
    is_direct: bool,
    members: Vec<UserId>,
    /// Ascending by id.
    messages: Vec<WireMessage>,
    read_marks: HashMap<UserId, MessageId>,
}

impl ChannelRecord {
    fn message_mut(&mut self, id: MessageId) -> Result<&mut WireMessage, StoreError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::UnknownMessage(id))
    }

    fn summary_for(&self, id: ChannelId, user: UserId) -> ChannelSummary {
        let mark = self.read_marks.get(&user).copied();
        let unread = self
            .messages
            .iter()
            .filter(|m| m.user_id != user && mark.is_none_or(|mark| m.id > mark))
            .count();
        let others = self
            .read_marks
            .iter()
            .filter(|(reader, _)| **reader != user)
            .map(|(_, mark)| *mark)
            .max();
        ChannelSummary {
            id,
            name: self.name.clone(),
            is_direct: self.is_direct,
            unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
            mute_until: None,
            last_read_message_id: mark,
            others_read_message_id: if self.is_direct { others } else { None },
            is_pinned: false,
            member_ids: self.members.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    channels: BTreeMap<ChannelId, ChannelRecord>,
    usernames: HashMap<UserId, String>,
    next_message_id: i64,
}

impl StoreInner {
    fn channel_for(&mut self, id: ChannelId, user: UserId) -> Result<&mut ChannelRecord, StoreError> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(StoreError::UnknownChannel(id))?;
        if channel.members.contains(&user) {
            Ok(channel)
        } else {
            Err(StoreError::NotMember { channel: id, user })
        }
    }
}

/// Thread-safe in-memory chat data.
#[derive(Debug, Default)]
pub struct ChatStore {
    inner: RwLock<StoreInner>,
}

impl ChatStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a channel. Existing messages are kept.
    pub async fn seed_channel(
        &self,
        id: ChannelId,
        name: &str,
        is_direct: bool,
        members: Vec<UserId>,
    ) {
        let mut inner = self.inner.write().await;
        let record = inner.channels.entry(id).or_insert_with(|| ChannelRecord {
            name: String::new(),
            is_direct,
            members: Vec::new(),
            messages: Vec::new(),
            read_marks: HashMap::new(),
        });
        record.name = name.to_string();
        record.is_direct = is_direct;
        record.members = members;
    }

    /// Sets the display username of a user.
    pub async fn set_username(&self, user: UserId, name: &str) {
        self.inner
            .write()
            .await
            .usernames
            .insert(user, name.to_string());
    }

    /// The username of a user, defaulting to `user<id>`.
    pub async fn username(&self, user: UserId) -> String {
        self.inner
            .read()
            .await
            .usernames
            .get(&user)
            .cloned()
            .unwrap_or_else(|| format!("user{user}"))
    }

    /// Members of a channel.
    pub async fn members(&self, channel: ChannelId) -> Option<Vec<UserId>> {
        self.inner
            .read()
            .await
            .channels
            .get(&channel)
            .map(|c| c.members.clone())
    }

    /// Appends a message authored by `user`. A reply increments its
    /// parent's reply count.
    ///
    /// # Errors
    ///
    /// Fails if the channel is unknown or `user` is not a member.
    pub async fn post(
        &self,
        user: UserId,
        channel: ChannelId,
        content: String,
        parent_id: Option<MessageId>,
        client_nonce: Option<Uuid>,
    ) -> Result<WireMessage, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_message_id += 1;
        let id = MessageId(inner.next_message_id);
        let username = inner.usernames.get(&user).cloned();

        let record = inner.channel_for(channel, user)?;
        if let Some(parent) = parent_id
            && let Ok(parent) = record.message_mut(parent)
        {
            parent.reply_count += 1;
        }
        let message = WireMessage {
            id,
            channel_id: channel,
            user_id: user,
            content,
            created_at: Utc::now(),
            parent_id,
            document_id: None,
            reactions: Vec::new(),
            username,
            reply_count: 0,
            client_nonce,
        };
        record.messages.push(message.clone());
        drop(inner);
        Ok(message)
    }

    /// Removes a message. Deleting a reply decrements its parent's count.
    ///
    /// # Errors
    ///
    /// Fails if the channel or message is unknown.
    pub async fn delete(&self, channel: ChannelId, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .channels
            .get_mut(&channel)
            .ok_or(StoreError::UnknownChannel(channel))?;
        let index = record
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or(StoreError::UnknownMessage(id))?;
        let removed = record.messages.remove(index);
        if let Some(parent) = removed.parent_id
            && let Ok(parent) = record.message_mut(parent)
        {
            parent.reply_count = parent.reply_count.saturating_sub(1);
        }
        Ok(())
    }

    /// One history page: skips the `offset` newest messages, takes up to
    /// `limit` before them, and returns them ascending by id.
    ///
    /// # Errors
    ///
    /// Fails if the channel is unknown or `user` is not a member.
    pub async fn history(
        &self,
        user: UserId,
        channel: ChannelId,
        query: HistoryQuery,
    ) -> Result<Vec<WireMessage>, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.channel_for(channel, user)?;
        let len = record.messages.len();
        let end = len.saturating_sub(usize::try_from(query.offset).unwrap_or(usize::MAX));
        let start = end.saturating_sub(usize::try_from(query.limit).unwrap_or(usize::MAX));
        Ok(record.messages[start..end].to_vec())
    }

    /// Channel list with per-user unread counts, ascending by id.
    pub async fn summaries(&self, user: UserId) -> Vec<ChannelSummary> {
        let inner = self.inner.read().await;
        inner
            .channels
            .iter()
            .filter(|(_, c)| c.members.contains(&user))
            .map(|(id, c)| c.summary_for(*id, user))
            .collect()
    }

    /// Marks a channel read up to its newest message.
    ///
    /// # Errors
    ///
    /// Fails if the channel is unknown or `user` is not a member.
    pub async fn mark_read(
        &self,
        user: UserId,
        channel: ChannelId,
    ) -> Result<ReadConfirmation, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.channel_for(channel, user)?;
        let last_read_id = record.messages.last().map(|m| m.id);
        if let Some(last) = last_read_id {
            record.read_marks.insert(user, last);
        }
        Ok(ReadConfirmation {
            channel_id: channel,
            last_read_id,
        })
    }

    /// Adds a reaction. Returns the reaction if it was not present.
    ///
    /// # Errors
    ///
    /// Fails if the channel or message is unknown, or `user` is not a
    /// member.
    pub async fn add_reaction(
        &self,
        user: UserId,
        channel: ChannelId,
        id: MessageId,
        emoji: &str,
    ) -> Result<Option<WireReaction>, StoreError> {
        let mut inner = self.inner.write().await;
        let username = inner
            .usernames
            .get(&user)
            .cloned()
            .unwrap_or_else(|| format!("user{user}"));
        let message = inner.channel_for(channel, user)?.message_mut(id)?;
        if message
            .reactions
            .iter()
            .any(|r| r.user_id == user && r.emoji == emoji)
        {
            return Ok(None);
        }
        let reaction = WireReaction {
            user_id: user,
            emoji: emoji.to_string(),
            username,
            avatar_url: None,
        };
        message.reactions.push(reaction.clone());
        drop(inner);
        Ok(Some(reaction))
    }

    /// Removes a reaction. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails if the channel or message is unknown, or `user` is not a
    /// member.
    pub async fn remove_reaction(
        &self,
        user: UserId,
        channel: ChannelId,
        id: MessageId,
        emoji: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let message = inner.channel_for(channel, user)?.message_mut(id)?;
        let before = message.reactions.len();
        message
            .reactions
            .retain(|r| !(r.user_id == user && r.emoji == emoji));
        Ok(message.reactions.len() != before)
    }
}
