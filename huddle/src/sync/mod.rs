//! The single-writer sync engine.
//!
//! [`SyncEngine`] owns every client-side store: channels, messages,
//! typing, unread counters, presence and the notification router. There is
//! no shared or global state; the driver task in [`crate::net`] owns the
//! engine and feeds it decoded server events, user actions and REST
//! completions one at a time.
//!
//! Every mutator returns the [`SyncEvent`]s it produced. Within one inbound
//! event, domain state is merged first and notifications are derived from
//! the merged result afterwards, so a message that did not merge (for
//! example a duplicate) never notifies. Side effects the engine cannot
//! perform itself (transmitting a frame, fetching a page, confirming a
//! read) are returned as effect variants for the driver to execute; see
//! [`SyncEvent::is_effect`].

pub mod channels;
pub mod messages;
pub mod notify;
pub mod presence;
pub mod reactions;
pub mod typing;
pub mod unread;

use std::time::Duration;

use tokio::time::Instant;

use huddle_proto::event::{PresenceStatus, ServerEvent, WireMessage};
use huddle_proto::ids::{ChannelId, DocumentId, MessageId, UserId};
use huddle_proto::outbound::ClientFrame;
use huddle_proto::rest::{ChannelSummary, HistoryQuery};

use crate::clock::Moment;

pub use channels::{Channel, ChannelKind, ChannelRegistry};
pub use messages::{Applied, Delivery, MergeOutcome, Message, MessageStore, SendState};
pub use notify::{
    Notification, NotificationPrefs, NotificationRouter, ToastKind, Trigger, TriggerKind,
};
pub use presence::PresenceTracker;
pub use reactions::{Reaction, ReactionGroup, ReactionSet};
pub use typing::{Typist, TypingAggregator};
pub use unread::{SnapshotTicket, UnreadTracker};

/// A REST response that arrived after the engine stopped waiting for it.
///
/// Never surfaced to the user; the driver logs and drops it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StaleResponse {
    /// A history page for a channel that is no longer open, or superseded
    /// by a newer request.
    #[error("history page for channel {channel_id} (request {token}) is stale")]
    Page {
        /// Channel the request was issued for.
        channel_id: ChannelId,
        /// Request token.
        token: u64,
    },
    /// An unread snapshot superseded by a newer request.
    #[error("unread snapshot {ticket} was superseded")]
    Snapshot {
        /// Ticket number of the stale request.
        ticket: u64,
    },
}

/// The user the engine runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Authenticated user id.
    pub user_id: UserId,
    /// Username, used for `@mention` detection and optimistic reactions.
    pub username: String,
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages per history page.
    pub page_size: u32,
    /// How far back an echo without nonce may match a pending send.
    pub echo_window: Duration,
    /// How long a typing signal stays valid.
    pub typing_expiry: Duration,
    /// Minimum gap between repeated outbound "is typing" frames.
    pub typing_resend: Duration,
    /// Notification preferences.
    pub notifications: NotificationPrefs,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            echo_window: Duration::from_secs(10),
            typing_expiry: typing::DEFAULT_TYPING_EXPIRY,
            typing_resend: Duration::from_secs(3),
            notifications: NotificationPrefs::default(),
        }
    }
}

/// Why a history page is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePurpose {
    /// Backfill of older history (infinite scroll).
    Older,
    /// Refresh of the newest page after a reconnect.
    Latest,
}

/// An outstanding history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Channel the page is for.
    pub channel_id: ChannelId,
    /// Identifies this request; later requests supersede it.
    pub token: u64,
    /// Backfill or refresh.
    pub purpose: PagePurpose,
    /// Offset and limit to send.
    pub query: HistoryQuery,
}

/// What the engine did, or wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The channel list was replaced from a snapshot.
    ChannelsChanged,
    /// The open channel changed.
    ActiveChannelChanged {
        /// The newly open channel, if any.
        channel_id: Option<ChannelId>,
    },
    /// Messages of a channel changed.
    MessagesChanged {
        /// Affected channel.
        channel_id: ChannelId,
    },
    /// A pending send was confirmed by its echo.
    MessageConfirmed {
        /// Channel of the message.
        channel_id: ChannelId,
        /// The retired temporary id.
        temp_id: MessageId,
        /// The server id.
        id: MessageId,
    },
    /// A history page was merged. Carries lengths for scroll anchoring.
    PageMerged {
        /// Channel of the page.
        channel_id: ChannelId,
        /// Merge details.
        outcome: MergeOutcome,
    },
    /// Reactions on a message changed.
    ReactionsChanged {
        /// Channel of the message.
        channel_id: ChannelId,
        /// The message.
        message_id: MessageId,
    },
    /// The typing set of a channel changed.
    TypingChanged {
        /// Affected channel.
        channel_id: ChannelId,
    },
    /// A channel's unread count changed.
    UnreadChanged {
        /// Affected channel.
        channel_id: ChannelId,
        /// The new count.
        count: u32,
    },
    /// The number of unopened shared documents changed.
    DocumentsUnreadChanged {
        /// The new count.
        count: usize,
    },
    /// A user went online or offline.
    PresenceChanged {
        /// The user.
        user_id: UserId,
        /// Whether they are online now.
        online: bool,
    },
    /// A channel's online participant count changed.
    OnlineCountChanged {
        /// Affected channel.
        channel_id: ChannelId,
        /// The new count.
        count: u32,
    },
    /// Another member read up to a message.
    ReadByOthers {
        /// Affected channel.
        channel_id: ChannelId,
        /// The reader.
        user_id: UserId,
        /// Their read position.
        last_read_id: MessageId,
    },
    /// A user-facing notification.
    Notify(Notification),

    /// Effect: push a frame over the connection. A failed message send
    /// must be reported back through [`SyncEngine::mark_send_failed`].
    Transmit {
        /// The frame.
        frame: ClientFrame,
        /// Temporary id of the pending message this frame carries.
        temp_id: Option<MessageId>,
    },
    /// Effect: fetch a history page, then call
    /// [`SyncEngine::complete_page`] or [`SyncEngine::page_failed`].
    FetchPage(PageRequest),
    /// Effect: fetch the channel list, then call
    /// [`SyncEngine::apply_channel_list`].
    FetchChannels(SnapshotTicket),
    /// Effect: mark the channel read on the server, then call
    /// [`SyncEngine::confirm_read`].
    MarkReadRequested {
        /// Channel to mark.
        channel_id: ChannelId,
    },
    /// Effect: persist a reaction toggle, calling
    /// [`SyncEngine::reaction_failed`] if it fails.
    SyncReaction {
        /// Channel of the message.
        channel_id: ChannelId,
        /// The message.
        message_id: MessageId,
        /// The emoji.
        emoji: String,
        /// `true` to add, `false` to remove.
        add: bool,
    },
}

impl SyncEvent {
    /// Whether this is a request for the driver rather than a state change.
    #[must_use]
    pub const fn is_effect(&self) -> bool {
        matches!(
            self,
            Self::Transmit { .. }
                | Self::FetchPage(_)
                | Self::FetchChannels(_)
                | Self::MarkReadRequested { .. }
                | Self::SyncReaction { .. }
        )
    }
}

/// An owned snapshot of one channel, for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelView {
    /// Channel metadata, if the channel is known.
    pub channel: Option<Channel>,
    /// Messages in display order.
    pub messages: Vec<Message>,
    /// Unread count.
    pub unread: u32,
    /// Users typing right now.
    pub typing: Vec<Typist>,
    /// Whether older history is exhausted.
    pub exhausted: bool,
}

/// Owns and updates all client-side chat state.
#[derive(Debug)]
pub struct SyncEngine {
    session: Session,
    config: SyncConfig,
    channels: ChannelRegistry,
    messages: MessageStore,
    typing: TypingAggregator,
    unread: UnreadTracker,
    presence: PresenceTracker,
    router: NotificationRouter,
    active: Option<ChannelId>,
    older: Option<PageRequest>,
    latest: Option<PageRequest>,
    next_token: u64,
    /// Channel and time of the last outbound "is typing" frame.
    typing_sent: Option<(ChannelId, Instant)>,
    connected: bool,
}

impl SyncEngine {
    /// Creates an engine with empty stores.
    #[must_use]
    pub fn new(session: Session, config: SyncConfig) -> Self {
        let me = session.user_id;
        Self {
            messages: MessageStore::new(me, config.echo_window),
            typing: TypingAggregator::new(me, config.typing_expiry),
            router: NotificationRouter::new(config.notifications),
            session,
            config,
            channels: ChannelRegistry::new(),
            unread: UnreadTracker::new(),
            presence: PresenceTracker::new(),
            active: None,
            older: None,
            latest: None,
            next_token: 0,
            typing_sent: None,
            connected: false,
        }
    }

    // -- inbound events ---------------------------------------------------

    /// Applies one decoded server event.
    pub fn handle_event(&mut self, event: ServerEvent, now: Moment) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        match event {
            ServerEvent::NewMessage(wire) => self.on_new_message(wire, now, &mut out),
            ServerEvent::MessageDeleted { message_id } => {
                if let Some(channel_id) = self.messages.remove_message(message_id) {
                    out.push(SyncEvent::MessagesChanged { channel_id });
                } else {
                    tracing::debug!(message_id = %message_id, "delete for a message that is not loaded");
                }
            }
            ServerEvent::ReactionAdded {
                message_id,
                reaction,
            } => {
                if let Some(channel_id) = self.update_reactions(message_id, |set| set.add(reaction))
                {
                    out.push(SyncEvent::ReactionsChanged {
                        channel_id,
                        message_id,
                    });
                }
            }
            ServerEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            } => {
                if let Some(channel_id) =
                    self.update_reactions(message_id, |set| set.remove(user_id, &emoji))
                {
                    out.push(SyncEvent::ReactionsChanged {
                        channel_id,
                        message_id,
                    });
                }
            }
            ServerEvent::Typing {
                user_id,
                full_name,
                username,
                is_typing,
                channel_id,
            } => {
                if let Some(channel_id) = self.resolve_channel(channel_id, "typing") {
                    let name = if full_name.is_empty() {
                        username
                    } else {
                        full_name
                    };
                    if self
                        .typing
                        .signal(channel_id, user_id, &name, is_typing, now.instant)
                    {
                        out.push(SyncEvent::TypingChanged { channel_id });
                    }
                }
            }
            ServerEvent::Presence {
                online_count,
                channel_id,
            } => {
                if let Some(channel_id) = self.resolve_channel(channel_id, "presence")
                    && let Some(channel) = self.channels.get_mut(channel_id)
                    && channel.online_count != online_count
                {
                    channel.online_count = online_count;
                    out.push(SyncEvent::OnlineCountChanged {
                        channel_id,
                        count: online_count,
                    });
                }
            }
            ServerEvent::UserPresence {
                user_id,
                status,
                last_seen,
            } => {
                let changed = match status {
                    PresenceStatus::Online => self.presence.set_online(user_id),
                    PresenceStatus::Offline => self
                        .presence
                        .set_offline(user_id, last_seen.unwrap_or(now.wall)),
                };
                if changed {
                    out.push(SyncEvent::PresenceChanged {
                        user_id,
                        online: status == PresenceStatus::Online,
                    });
                    self.rederive_online_counts(Some(user_id), &mut out);
                }
            }
            ServerEvent::ReadReceipt {
                channel_id,
                user_id,
                last_read_id,
            } => {
                if user_id == self.session.user_id {
                    self.apply_read(channel_id, Some(last_read_id), &mut out);
                } else if let Some(channel) = self.channels.get_mut(channel_id) {
                    if channel.kind == ChannelKind::Direct {
                        channel.others_read_id = channel.others_read_id.max(Some(last_read_id));
                    }
                    out.push(SyncEvent::ReadByOthers {
                        channel_id,
                        user_id,
                        last_read_id,
                    });
                }
            }
            ServerEvent::DocumentShared {
                document_id,
                channel_id,
                sender_id,
            } => self.on_document_shared(document_id, channel_id, sender_id, now, &mut out),
        }
        out
    }

    fn on_new_message(&mut self, wire: WireMessage, now: Moment, out: &mut Vec<SyncEvent>) {
        let channel_id = wire.channel_id;
        let message_id = wire.id;
        let author_id = wire.user_id;
        let self_authored = author_id == self.session.user_id;
        let title = wire
            .username
            .clone()
            .unwrap_or_else(|| format!("user {author_id}"));
        let body = wire.content.clone();

        match self.messages.reconcile_server_message(wire, now.instant) {
            Applied::Duplicate => {
                tracing::trace!(message_id = %message_id, "duplicate new_message ignored");
                return;
            }
            Applied::Reconciled { temp_id } => out.push(SyncEvent::MessageConfirmed {
                channel_id,
                temp_id,
                id: message_id,
            }),
            Applied::Inserted => {}
        }
        out.push(SyncEvent::MessagesChanged { channel_id });

        // A posted message ends its author's typing indicator.
        if self
            .typing
            .signal(channel_id, author_id, "", false, now.instant)
        {
            out.push(SyncEvent::TypingChanged { channel_id });
        }
        if self_authored {
            return;
        }

        let viewing = self.active == Some(channel_id);
        if viewing {
            out.push(SyncEvent::MarkReadRequested { channel_id });
        } else {
            let count = self.unread.increment(channel_id);
            out.push(SyncEvent::UnreadChanged { channel_id, count });
        }

        let trigger = Trigger {
            kind: TriggerKind::Message,
            channel_id: Some(channel_id),
            mute_until: self.channels.get(channel_id).and_then(|c| c.mute_until),
            viewing,
            self_authored,
            is_mention: notify::mentions(&body, &self.session.username),
            title,
            body,
        };
        if let Some(notification) = self.router.route(trigger, now.wall) {
            out.push(SyncEvent::Notify(notification));
        }
    }

    fn on_document_shared(
        &mut self,
        document_id: DocumentId,
        channel_id: ChannelId,
        sender_id: UserId,
        now: Moment,
        out: &mut Vec<SyncEvent>,
    ) {
        if sender_id == self.session.user_id {
            return;
        }
        if !self.unread.mark_document_shared(document_id, channel_id) {
            return;
        }
        out.push(SyncEvent::DocumentsUnreadChanged {
            count: self.unread.document_count(),
        });

        let channel = self.channels.get(channel_id);
        let trigger = Trigger {
            kind: TriggerKind::DocumentShared,
            channel_id: Some(channel_id),
            mute_until: channel.and_then(|c| c.mute_until),
            viewing: self.active == Some(channel_id),
            self_authored: false,
            is_mention: false,
            title: channel.map_or_else(|| "Document shared".to_owned(), |c| c.name.clone()),
            body: format!("document {document_id} was shared"),
        };
        if let Some(notification) = self.router.route(trigger, now.wall) {
            out.push(SyncEvent::Notify(notification));
        }
    }

    // -- navigation and history -------------------------------------------

    /// Makes `channel_id` the open channel.
    ///
    /// Tears down typing state of the previous channel and cancels its
    /// outstanding page requests. Requests a read confirmation if the new
    /// channel has unread messages, and a page if none is loaded or a
    /// history gap is still open.
    pub fn open_channel(&mut self, channel_id: ChannelId) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        if self.active == Some(channel_id) {
            return out;
        }
        self.leave_active(&mut out);
        self.active = Some(channel_id);
        out.push(SyncEvent::ActiveChannelChanged {
            channel_id: Some(channel_id),
        });

        if self.unread.count(channel_id) > 0 {
            out.push(SyncEvent::MarkReadRequested { channel_id });
        }
        if (self.messages.confirmed_len(channel_id) == 0 || self.messages.has_gap(channel_id))
            && let Some(request) = self.begin_backfill()
        {
            out.push(SyncEvent::FetchPage(request));
        }
        out
    }

    /// Leaves the open channel without opening another.
    pub fn close_channel(&mut self) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        if self.active.is_some() {
            self.leave_active(&mut out);
            out.push(SyncEvent::ActiveChannelChanged { channel_id: None });
        }
        out
    }

    fn leave_active(&mut self, out: &mut Vec<SyncEvent>) {
        let Some(previous) = self.active.take() else {
            return;
        };
        if self.typing.clear_channel(previous) {
            out.push(SyncEvent::TypingChanged {
                channel_id: previous,
            });
        }
        if let Some((channel_id, _)) = self.typing_sent.take() {
            out.push(SyncEvent::Transmit {
                frame: ClientFrame::Typing {
                    channel_id,
                    is_typing: false,
                },
                temp_id: None,
            });
        }
        for request in [self.older.take(), self.latest.take()].into_iter().flatten() {
            tracing::debug!(
                channel_id = %request.channel_id,
                token = request.token,
                "cancelled history request for channel being left"
            );
        }
    }

    /// Requests the next older page for the open channel. An open history
    /// gap is filled first.
    ///
    /// Returns `None` if no channel is open, history is exhausted, or a
    /// backfill is already in flight.
    pub fn begin_backfill(&mut self) -> Option<PageRequest> {
        let channel_id = self.active?;
        if self.older.is_some()
            || (self.messages.is_exhausted(channel_id) && !self.messages.has_gap(channel_id))
        {
            return None;
        }
        let offset = u32::try_from(self.messages.backfill_offset(channel_id)).unwrap_or(u32::MAX);
        let request = self.issue_page(channel_id, PagePurpose::Older, offset);
        self.older = Some(request);
        Some(request)
    }

    /// Requests the newest page for the open channel, superseding any
    /// refresh already in flight.
    pub fn begin_refresh(&mut self) -> Option<PageRequest> {
        let channel_id = self.active?;
        let request = self.issue_page(channel_id, PagePurpose::Latest, 0);
        self.latest = Some(request);
        Some(request)
    }

    fn issue_page(&mut self, channel_id: ChannelId, purpose: PagePurpose, offset: u32) -> PageRequest {
        self.next_token += 1;
        PageRequest {
            channel_id,
            token: self.next_token,
            purpose,
            query: HistoryQuery {
                limit: self.config.page_size,
                offset,
            },
        }
    }

    /// Merges the response to `request`. While the channel has a history
    /// gap, the next older page is requested right away.
    ///
    /// # Errors
    ///
    /// Returns [`StaleResponse::Page`] if the request was cancelled by a
    /// channel switch or superseded; the page is discarded untouched.
    pub fn complete_page(
        &mut self,
        request: PageRequest,
        page: Vec<WireMessage>,
        now: Moment,
    ) -> Result<Vec<SyncEvent>, StaleResponse> {
        let slot = match request.purpose {
            PagePurpose::Older => &mut self.older,
            PagePurpose::Latest => &mut self.latest,
        };
        if *slot != Some(request) || self.active != Some(request.channel_id) {
            return Err(StaleResponse::Page {
                channel_id: request.channel_id,
                token: request.token,
            });
        }
        *slot = None;

        let channel_id = request.channel_id;
        let page_size = usize::try_from(request.query.limit).unwrap_or(usize::MAX);
        let outcome = match request.purpose {
            PagePurpose::Older => self
                .messages
                .merge_page(channel_id, page, page_size, now.instant),
            PagePurpose::Latest => self
                .messages
                .merge_latest(channel_id, page, page_size, now.instant),
        };
        let gap = self.messages.has_gap(channel_id);
        tracing::debug!(
            channel_id = %channel_id,
            inserted = outcome.inserted,
            exhausted = outcome.exhausted,
            gap,
            "history page merged"
        );
        let mut out = vec![SyncEvent::PageMerged {
            channel_id,
            outcome,
        }];
        if gap && let Some(next) = self.begin_backfill() {
            out.push(SyncEvent::FetchPage(next));
        }
        Ok(out)
    }

    /// Forgets a failed page request so it can be issued again.
    pub fn page_failed(&mut self, request: PageRequest) {
        for slot in [&mut self.older, &mut self.latest] {
            if *slot == Some(request) {
                *slot = None;
            }
        }
    }

    // -- local actions ----------------------------------------------------

    /// Sends a message optimistically.
    pub fn send_message(
        &mut self,
        channel_id: ChannelId,
        content: String,
        parent_id: Option<MessageId>,
        now: Moment,
    ) -> Vec<SyncEvent> {
        let sent = self.messages.apply_optimistic_send(
            channel_id,
            content.clone(),
            parent_id,
            now.instant,
            now.wall,
        );
        if self
            .typing_sent
            .is_some_and(|(typing_in, _)| typing_in == channel_id)
        {
            self.typing_sent = None;
        }
        vec![
            SyncEvent::MessagesChanged { channel_id },
            SyncEvent::Transmit {
                frame: ClientFrame::Message {
                    channel_id,
                    content,
                    parent_id,
                    client_nonce: sent.nonce,
                },
                temp_id: Some(sent.temp_id),
            },
        ]
    }

    /// Records that the frame for `temp_id` could not be sent. The message
    /// stays pending until [`retry_send`](Self::retry_send).
    pub fn mark_send_failed(&mut self, temp_id: MessageId) -> Vec<SyncEvent> {
        if !self.messages.mark_send_failed(temp_id) {
            return Vec::new();
        }
        self.messages
            .get(temp_id)
            .map(|m| SyncEvent::MessagesChanged {
                channel_id: m.channel_id,
            })
            .into_iter()
            .collect()
    }

    /// Re-sends a pending message with its original nonce.
    pub fn retry_send(&mut self, temp_id: MessageId, now: Moment) -> Vec<SyncEvent> {
        let Some(retry) = self.messages.prepare_retry(temp_id, now.instant, now.wall) else {
            return Vec::new();
        };
        vec![
            SyncEvent::MessagesChanged {
                channel_id: retry.channel_id,
            },
            SyncEvent::Transmit {
                frame: ClientFrame::Message {
                    channel_id: retry.channel_id,
                    content: retry.content,
                    parent_id: retry.parent_id,
                    client_nonce: retry.nonce,
                },
                temp_id: Some(temp_id),
            },
        ]
    }

    /// Reports the local user typing (or not) in the open channel.
    ///
    /// Repeated `true` signals are throttled to one frame per
    /// `typing_resend`; `false` is sent only after a `true`.
    pub fn set_typing(&mut self, is_typing: bool, now: Moment) -> Vec<SyncEvent> {
        let Some(channel_id) = self.active else {
            return Vec::new();
        };
        if is_typing {
            if let Some((sent_in, at)) = self.typing_sent
                && sent_in == channel_id
                && now.instant.saturating_duration_since(at) < self.config.typing_resend
            {
                return Vec::new();
            }
            self.typing_sent = Some((channel_id, now.instant));
        } else if self.typing_sent.take().is_none() {
            return Vec::new();
        }
        vec![SyncEvent::Transmit {
            frame: ClientFrame::Typing {
                channel_id,
                is_typing,
            },
            temp_id: None,
        }]
    }

    /// Adds our reaction if absent, removes it otherwise. Applied locally
    /// right away; the server round-trip is requested as an effect.
    pub fn toggle_reaction(&mut self, message_id: MessageId, emoji: &str) -> Vec<SyncEvent> {
        let me = self.session.user_id;
        let Some(message) = self.messages.get_mut(message_id) else {
            tracing::debug!(message_id = %message_id, "reaction toggle on unknown message");
            return Vec::new();
        };
        if message.is_pending() {
            return Vec::new();
        }
        let channel_id = message.channel_id;
        let add = !message.reactions.contains(me, emoji);
        if add {
            message.reactions.add(Reaction {
                user_id: me,
                emoji: emoji.to_owned(),
                username: self.session.username.clone(),
                avatar_url: None,
            });
        } else {
            message.reactions.remove(me, emoji);
        }
        vec![
            SyncEvent::ReactionsChanged {
                channel_id,
                message_id,
            },
            SyncEvent::SyncReaction {
                channel_id,
                message_id,
                emoji: emoji.to_owned(),
                add,
            },
        ]
    }

    /// Reverts an optimistic reaction toggle the server rejected.
    pub fn reaction_failed(&mut self, message_id: MessageId, emoji: &str, add: bool) -> Vec<SyncEvent> {
        let me = self.session.user_id;
        let username = self.session.username.clone();
        let reverted = self.update_reactions(message_id, |set| {
            if add {
                set.remove(me, emoji)
            } else {
                set.add(Reaction {
                    user_id: me,
                    emoji: emoji.to_owned(),
                    username,
                    avatar_url: None,
                })
            }
        });
        reverted
            .map(|channel_id| SyncEvent::ReactionsChanged {
                channel_id,
                message_id,
            })
            .into_iter()
            .collect()
    }

    /// Applies a server-confirmed mark-read. The channel's unread count is
    /// zero afterwards regardless of its prior value.
    pub fn confirm_read(
        &mut self,
        channel_id: ChannelId,
        last_read_id: Option<MessageId>,
    ) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        self.apply_read(channel_id, last_read_id, &mut out);
        out
    }

    fn apply_read(
        &mut self,
        channel_id: ChannelId,
        last_read_id: Option<MessageId>,
        out: &mut Vec<SyncEvent>,
    ) {
        if let Some(channel) = self.channels.get_mut(channel_id)
            && last_read_id.is_some()
        {
            channel.last_read_id = channel.last_read_id.max(last_read_id);
        }
        self.unread.clear(channel_id);
        out.push(SyncEvent::UnreadChanged {
            channel_id,
            count: 0,
        });
    }

    /// Marks every shared document as seen (the board was opened).
    pub fn visit_board(&mut self) -> Vec<SyncEvent> {
        if self.unread.clear_documents() {
            vec![SyncEvent::DocumentsUnreadChanged { count: 0 }]
        } else {
            Vec::new()
        }
    }

    /// Marks one shared document as opened.
    pub fn open_document(&mut self, document_id: DocumentId) -> Vec<SyncEvent> {
        if self.unread.clear_document(document_id) {
            vec![SyncEvent::DocumentsUnreadChanged {
                count: self.unread.document_count(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Replaces a channel's member list and re-derives its online count.
    pub fn set_members(&mut self, channel_id: ChannelId, members: Vec<UserId>) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        if !self.channels.set_members(channel_id, members) {
            return out;
        }
        if let Some(channel) = self.channels.get_mut(channel_id) {
            let count = self.presence.online_among(&channel.members);
            if count != channel.online_count {
                channel.online_count = count;
                out.push(SyncEvent::OnlineCountChanged { channel_id, count });
            }
        }
        out
    }

    /// Replaces the notification preferences.
    pub const fn set_notification_prefs(&mut self, prefs: NotificationPrefs) {
        self.router.set_prefs(prefs);
    }

    // -- snapshots and connection -----------------------------------------

    /// Starts an unread snapshot request. Apply the response with
    /// [`apply_channel_list`](Self::apply_channel_list).
    pub fn begin_snapshot(&mut self) -> SnapshotTicket {
        self.unread.begin_snapshot()
    }

    /// Forgets a failed snapshot request. Returns `false` if `ticket` was
    /// already superseded, in which case no retry is needed.
    pub fn snapshot_failed(&mut self, ticket: SnapshotTicket) -> bool {
        self.unread.abandon_snapshot(ticket)
    }

    /// Whether a channel list request is outstanding.
    #[must_use]
    pub const fn snapshot_pending(&self) -> bool {
        self.unread.snapshot_pending()
    }

    /// Applies a fetched channel list: channel metadata is refreshed and
    /// unread counts are replaced by the snapshot, with live changes made
    /// during the fetch replayed on top.
    ///
    /// # Errors
    ///
    /// Returns [`StaleResponse::Snapshot`] if `ticket` was superseded.
    pub fn apply_channel_list(
        &mut self,
        ticket: SnapshotTicket,
        list: Vec<ChannelSummary>,
    ) -> Result<Vec<SyncEvent>, StaleResponse> {
        let counts: Vec<(ChannelId, u32)> = list.iter().map(|s| (s.id, s.unread_count)).collect();
        let changed = self.unread.sync_from_snapshot(ticket, counts)?;

        let ids: Vec<ChannelId> = list.iter().map(|s| s.id).collect();
        for summary in list {
            self.channels.upsert_from_summary(summary);
        }
        for removed in self.channels.retain_ids(&ids) {
            tracing::info!(channel_id = %removed, "channel no longer listed, dropping");
        }

        let mut out = vec![SyncEvent::ChannelsChanged];
        out.extend(changed.into_iter().map(|channel_id| SyncEvent::UnreadChanged {
            channel_id,
            count: self.unread.count(channel_id),
        }));
        self.rederive_online_counts(None, &mut out);
        if let Some(active) = self.active
            && self.unread.count(active) > 0
        {
            out.push(SyncEvent::MarkReadRequested { channel_id: active });
        }
        Ok(out)
    }

    /// Reacts to the connection going up or down.
    ///
    /// Typing state and the online set are rebuilt from zero either way; the
    /// server re-announces who is online on every new link. On (re)connect a
    /// fresh unread snapshot and the open channel's newest page are
    /// requested.
    pub fn connection_changed(&mut self, connected: bool) -> Vec<SyncEvent> {
        self.connected = connected;
        self.typing_sent = None;
        let mut out: Vec<SyncEvent> = self
            .typing
            .clear_all()
            .into_iter()
            .map(|channel_id| SyncEvent::TypingChanged { channel_id })
            .collect();
        let forgotten = self.presence.forget_online();
        if !forgotten.is_empty() {
            out.extend(forgotten.into_iter().map(|user_id| SyncEvent::PresenceChanged {
                user_id,
                online: false,
            }));
            self.rederive_online_counts(None, &mut out);
        }
        if connected {
            out.push(SyncEvent::FetchChannels(self.unread.begin_snapshot()));
            if let Some(request) = self.begin_refresh() {
                out.push(SyncEvent::FetchPage(request));
            }
        }
        out
    }

    /// Periodic maintenance: expires typing entries.
    pub fn tick(&mut self, now: Moment) -> Vec<SyncEvent> {
        self.typing
            .sweep(now.instant)
            .into_iter()
            .map(|channel_id| SyncEvent::TypingChanged { channel_id })
            .collect()
    }

    // -- queries ----------------------------------------------------------

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn active_channel(&self) -> Option<ChannelId> {
        self.active
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Messages of a channel in display order.
    #[must_use]
    pub fn messages(&self, channel_id: ChannelId) -> Vec<&Message> {
        self.messages.messages(channel_id)
    }

    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    #[must_use]
    pub fn unread(&self, channel_id: ChannelId) -> u32 {
        self.unread.count(channel_id)
    }

    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.unread.total()
    }

    #[must_use]
    pub fn documents_unread(&self) -> usize {
        self.unread.document_count()
    }

    /// Names of users typing in a channel. Never includes expired entries.
    #[must_use]
    pub fn typing_names(&self, channel_id: ChannelId, now: Instant) -> Vec<String> {
        self.typing
            .typing_in(channel_id, now)
            .into_iter()
            .map(|t| t.display_name)
            .collect()
    }

    /// Reaction groups of a message, or empty if the message is unknown.
    #[must_use]
    pub fn reaction_groups(&self, message_id: MessageId) -> Vec<ReactionGroup> {
        self.messages
            .get(message_id)
            .map_or_else(Vec::new, |m| {
                m.reactions.group_for_display(self.session.user_id)
            })
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// Channels, pinned first.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    #[must_use]
    pub const fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// An owned snapshot of a channel for rendering.
    #[must_use]
    pub fn channel_view(&self, channel_id: ChannelId, now: Instant) -> ChannelView {
        ChannelView {
            channel: self.channels.get(channel_id).cloned(),
            messages: self
                .messages
                .messages(channel_id)
                .into_iter()
                .cloned()
                .collect(),
            unread: self.unread.count(channel_id),
            typing: self.typing.typing_in(channel_id, now),
            exhausted: self.messages.is_exhausted(channel_id),
        }
    }

    // -- helpers ----------------------------------------------------------

    fn resolve_channel(&self, explicit: Option<ChannelId>, kind: &'static str) -> Option<ChannelId> {
        let resolved = explicit.or(self.active);
        if resolved.is_none() {
            tracing::debug!(kind, "event without channel while no channel is open, dropping");
        }
        resolved
    }

    fn update_reactions(
        &mut self,
        message_id: MessageId,
        apply: impl FnOnce(&mut ReactionSet) -> bool,
    ) -> Option<ChannelId> {
        let message = self.messages.get_mut(message_id)?;
        apply(&mut message.reactions).then_some(message.channel_id)
    }

    fn rederive_online_counts(&mut self, touching: Option<UserId>, out: &mut Vec<SyncEvent>) {
        let presence = &self.presence;
        for channel in self.channels.iter_mut() {
            if channel.members.is_empty()
                || touching.is_some_and(|user_id| !channel.members.contains(&user_id))
            {
                continue;
            }
            let count = presence.online_among(&channel.members);
            if count != channel.online_count {
                channel.online_count = count;
                out.push(SyncEvent::OnlineCountChanged {
                    channel_id: channel.id,
                    count,
                });
            }
        }
    }
}
