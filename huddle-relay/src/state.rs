//! Shared relay state: connected users and event fan-out.
//!
//! Each user holds at most one socket. A newer connection replaces the
//! older one; the replaced socket's writer sees its channel close and
//! shuts down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use chrono::Utc;
use tokio::sync::{RwLock, mpsc};

use huddle_proto::event::{PresenceStatus, ServerEvent};
use huddle_proto::ids::{ChannelId, DocumentId, MessageId, UserId};

use crate::store::{ChatStore, StoreError};

struct Peer {
    conn_id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared relay server state.
pub struct RelayState {
    connections: RwLock<HashMap<UserId, Peer>>,
    next_conn: AtomicU64,
    max_page_size: u32,
    /// Chat data.
    pub store: ChatStore,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay with no channels and no connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            max_page_size: 200,
            store: ChatStore::new(),
        }
    }

    /// Caps the `limit` of history requests at `max` (at least 1).
    #[must_use]
    pub fn with_max_page_size(mut self, max: u32) -> Self {
        self.max_page_size = max.max(1);
        self
    }

    /// Largest history page served.
    #[must_use]
    pub const fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    /// Creates or replaces a channel and its member list.
    pub async fn seed_channel(
        &self,
        id: ChannelId,
        name: &str,
        is_direct: bool,
        members: &[UserId],
    ) {
        self.store
            .seed_channel(id, name, is_direct, members.to_vec())
            .await;
    }

    /// Registers a user's socket writer, returning its connection id.
    ///
    /// Returns `true` as the second value if an older connection was
    /// replaced.
    pub async fn register(
        &self,
        user: UserId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> (u64, bool) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .connections
            .write()
            .await
            .insert(user, Peer { conn_id, sender })
            .is_some();
        (conn_id, replaced)
    }

    /// Removes a user's connection if it is still `conn_id`. Returns
    /// whether it was removed.
    pub async fn unregister(&self, user: UserId, conn_id: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(&user).is_some_and(|p| p.conn_id == conn_id) {
            conns.remove(&user);
            true
        } else {
            false
        }
    }

    /// Users with a live connection.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.connections.read().await.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Sends an event to one user if connected.
    pub async fn send_to(&self, user: UserId, event: &ServerEvent) {
        let Some(text) = encode(event) else { return };
        if let Some(peer) = self.connections.read().await.get(&user) {
            let _ = peer.sender.send(Message::Text(text.into()));
        }
    }

    /// Sends an event to every connected user in `users` except `except`.
    pub async fn broadcast(&self, users: &[UserId], event: &ServerEvent, except: Option<UserId>) {
        let Some(text) = encode(event) else { return };
        let conns = self.connections.read().await;
        for user in users {
            if Some(*user) == except {
                continue;
            }
            if let Some(peer) = conns.get(user) {
                let _ = peer.sender.send(Message::Text(text.clone().into()));
            }
        }
    }

    /// Sends an event to every connected user except `except`.
    pub async fn broadcast_all(&self, event: &ServerEvent, except: Option<UserId>) {
        let users = self.online_users().await;
        self.broadcast(&users, event, except).await;
    }

    /// Announces a presence change to every other connected user.
    pub async fn announce_presence(&self, user: UserId, status: PresenceStatus) {
        let last_seen = (status == PresenceStatus::Offline).then(Utc::now);
        let event = ServerEvent::UserPresence {
            user_id: user,
            status,
            last_seen,
        };
        self.broadcast_all(&event, Some(user)).await;
    }

    /// Deletes a message and tells the channel's members.
    ///
    /// # Errors
    ///
    /// Fails if the channel or message is unknown.
    pub async fn delete_message(
        &self,
        channel: ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        self.store.delete(channel, message_id).await?;
        let members = self.store.members(channel).await.unwrap_or_default();
        self.broadcast(&members, &ServerEvent::MessageDeleted { message_id }, None)
            .await;
        Ok(())
    }

    /// Announces a shared document to the channel's members.
    ///
    /// # Errors
    ///
    /// Fails if the channel is unknown.
    pub async fn share_document(
        &self,
        sender: UserId,
        channel: ChannelId,
        document_id: DocumentId,
    ) -> Result<(), StoreError> {
        let members = self
            .store
            .members(channel)
            .await
            .ok_or(StoreError::UnknownChannel(channel))?;
        let event = ServerEvent::DocumentShared {
            document_id,
            channel_id: channel,
            sender_id: sender,
        };
        self.broadcast(&members, &event, None).await;
        Ok(())
    }

    /// Sends a Close frame to every connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, peer) in conns.iter() {
            tracing::info!(user_id = %user, "sending close frame");
            let _ = peer.sender.send(Message::Close(None));
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(error = %e, kind = event.kind(), "failed to encode event");
            None
        }
    }
}
