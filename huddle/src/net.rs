//! Sync driver: wires the connection supervisor and the REST client to a
//! [`SyncEngine`].
//!
//! # Architecture
//!
//! ```text
//! caller  ←── NetEvent ───  driver task  ←── Frame ───  connection supervisor
//!         ─── NetCommand →              ─── ClientFrame →
//!                                       ⇄ REST completions (spawned requests)
//! ```
//!
//! The engine is owned by a single task, so every mutation is serialized.
//! Effects the engine returns ([`SyncEvent::is_effect`]) are executed here:
//! frames go to the connection, REST calls run on spawned tasks and feed
//! their results back through an internal channel. State changes are
//! forwarded to the caller as [`NetEvent::Sync`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use huddle_proto::decode;
use huddle_proto::event::WireMessage;
use huddle_proto::ids::{ChannelId, DocumentId, MessageId, UserId};
use huddle_proto::rest::{ChannelSummary, ReadConfirmation};

use crate::api::{ApiError, ChatApi, HttpChatApi};
use crate::clock::Moment;
use crate::sync::{
    Channel, ChannelView, NotificationPrefs, PageRequest, Session, SnapshotTicket, SyncConfig,
    SyncEngine, SyncEvent,
};
use crate::transport::backoff::Backoff;
use crate::transport::connection::{self, ConnectionConfig, ConnectionHandle};
use crate::transport::ws::WsConnector;
use crate::transport::{ConnectionState, ConnectionStatus, Connector, Frame};

/// Commands sent from the caller to the driver task.
#[derive(Debug)]
pub enum NetCommand {
    /// Open a channel (makes it the active one).
    OpenChannel(ChannelId),
    /// Close the active channel.
    CloseChannel,
    /// Load the next page of older history for the active channel.
    LoadOlder,
    /// Send a message.
    Send {
        /// Target channel.
        channel_id: ChannelId,
        /// Message body.
        content: String,
        /// Message replied to, if any.
        parent_id: Option<MessageId>,
    },
    /// Resend a failed message.
    Retry(MessageId),
    /// Update the local typing state for the active channel.
    SetTyping(bool),
    /// Toggle our reaction on a message.
    ToggleReaction {
        /// The message.
        message_id: MessageId,
        /// The emoji.
        emoji: String,
    },
    /// The document board was opened.
    VisitBoard,
    /// A shared document was opened.
    OpenDocument(DocumentId),
    /// Replace a channel's member list.
    SetMembers {
        /// The channel.
        channel_id: ChannelId,
        /// Its members.
        members: Vec<UserId>,
    },
    /// Replace the notification preferences.
    SetNotificationPrefs(NotificationPrefs),
    /// Snapshot one channel for rendering.
    View {
        /// The channel.
        channel_id: ChannelId,
        /// Where to send the snapshot.
        reply: oneshot::Sender<ChannelView>,
    },
    /// List known channels with their unread counts.
    Channels {
        /// Where to send the list.
        reply: oneshot::Sender<Vec<(Channel, u32)>>,
    },
    /// Stop the driver and close the connection.
    Shutdown,
}

/// Events sent from the driver task to the caller.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// The connection status changed.
    Connection(ConnectionStatus),
    /// The engine state changed.
    Sync(SyncEvent),
    /// A background request failed.
    Error(String),
}

/// Configuration for the sync driver.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// WebSocket URL of the realtime endpoint.
    pub ws_url: Url,
    /// Base URL of the REST API.
    pub api_url: Url,
    /// Session token, sent on the handshake and as the bearer token.
    pub token: String,
    /// The user this client runs for.
    pub session: Session,
    /// Connection supervisor settings.
    pub connection: ConnectionConfig,
    /// Engine tunables.
    pub sync: SyncConfig,
    /// Timeout of each REST request.
    pub request_timeout: Duration,
    /// Interval of the typing expiry sweep.
    pub tick_interval: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

/// Errors from [`spawn_sync`].
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The REST client could not be built.
    #[error("api client: {0}")]
    Api(#[from] ApiError),
}

/// Spawns the driver against a WebSocket server and its REST API.
///
/// Must be called inside a tokio runtime. Connecting happens in the
/// background; progress is reported as [`NetEvent::Connection`].
///
/// # Errors
///
/// Returns [`NetError::Api`] if the HTTP client cannot be built.
pub fn spawn_sync(
    config: NetConfig,
) -> Result<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>), NetError> {
    let api = HttpChatApi::new(&config.api_url, config.token.clone(), config.request_timeout)?;
    let connector = WsConnector::new(config.ws_url.clone());
    Ok(spawn_with(connector, api, config))
}

/// Spawns the driver with explicit collaborators.
///
/// `config.ws_url` and `config.api_url` are ignored; `connector` and `api`
/// are used instead.
pub fn spawn_with<C: Connector, A: ChatApi>(
    connector: C,
    api: A,
    config: NetConfig,
) -> (mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel(config.channel_capacity);
    let (done_tx, done_rx) = mpsc::channel(config.channel_capacity);

    let snapshot_backoff = Backoff::new(config.connection.backoff);
    let (connection, inbound) = connection::spawn(connector, config.token, config.connection);
    let status = connection.subscribe();

    let driver = Driver {
        engine: SyncEngine::new(config.session, config.sync),
        api: Arc::new(api),
        connection,
        events: evt_tx,
        completions: done_tx,
        epoch: 0,
        snapshot_backoff,
    };
    tokio::spawn(driver.run(Inputs {
        inbound,
        status,
        commands: cmd_rx,
        completions: done_rx,
        tick_interval: config.tick_interval,
    }));

    (cmd_tx, evt_rx)
}

/// Result of a REST request, fed back into the driver.
enum Completion {
    Page {
        request: PageRequest,
        result: Result<Vec<WireMessage>, ApiError>,
    },
    Channels {
        ticket: SnapshotTicket,
        result: Result<Vec<ChannelSummary>, ApiError>,
    },
    /// The delay after a failed channel list fetch has passed.
    ChannelsRetryDue,
    Read {
        channel_id: ChannelId,
        result: Result<ReadConfirmation, ApiError>,
    },
    Reaction {
        message_id: MessageId,
        emoji: String,
        add: bool,
        result: Result<(), ApiError>,
    },
}

/// Receivers the driver loop selects over.
struct Inputs {
    inbound: mpsc::Receiver<Frame>,
    status: watch::Receiver<ConnectionStatus>,
    commands: mpsc::Receiver<NetCommand>,
    completions: mpsc::Receiver<Completion>,
    tick_interval: Duration,
}

struct Driver<A> {
    engine: SyncEngine,
    api: Arc<A>,
    connection: ConnectionHandle,
    events: mpsc::Sender<NetEvent>,
    completions: mpsc::Sender<Completion>,
    /// Epoch of the link the engine last saw come up.
    epoch: u64,
    /// Delays between channel list retries.
    snapshot_backoff: Backoff,
}

impl<A: ChatApi> Driver<A> {
    async fn run(mut self, mut inputs: Inputs) {
        let mut tick = tokio::time::interval(inputs.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Status first: the supervisor publishes a new link before it
            // forwards that link's frames, so they never overtake it.
            tokio::select! {
                biased;
                changed = inputs.status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *inputs.status.borrow_and_update();
                    self.on_status(status).await;
                }
                frame = inputs.inbound.recv() => {
                    let Some(frame) = frame else { break };
                    self.on_frame(frame).await;
                }
                command = inputs.commands.recv() => match command {
                    None | Some(NetCommand::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(done) = inputs.completions.recv() => self.on_completion(done).await,
                _ = tick.tick() => {
                    let events = self.engine.tick(Moment::now());
                    self.dispatch(events).await;
                }
            }
        }

        tracing::info!("sync driver shutting down");
        self.connection.close().await;
    }

    async fn on_frame(&mut self, frame: Frame) {
        let decoded = match frame {
            Frame::Text(text) => decode::decode(&text),
            Frame::Binary(bytes) => decode::decode_bytes(&bytes),
            Frame::Heartbeat => return,
        };
        match decoded {
            Ok(event) => {
                let events = self.engine.handle_event(event, Moment::now());
                self.dispatch(events).await;
            }
            Err(decode::DecodeError::UnknownKind(kind)) => {
                tracing::debug!(kind = %kind, "ignoring unknown event kind");
            }
            Err(e) => tracing::warn!(err = %e, "dropping undecodable frame"),
        }
    }

    async fn on_status(&mut self, status: ConnectionStatus) {
        self.emit(NetEvent::Connection(status)).await;
        let connected = status.state == ConnectionState::Connected;
        // Status updates coalesce; a new epoch is a reconnect even if the
        // drop in between was never observed.
        let relinked = connected && status.epoch != self.epoch;
        if relinked || connected != self.engine.is_connected() {
            if connected {
                self.epoch = status.epoch;
            }
            let events = self.engine.connection_changed(connected);
            self.dispatch(events).await;
        }
    }

    async fn on_command(&mut self, command: NetCommand) {
        let now = Moment::now();
        let events = match command {
            NetCommand::OpenChannel(channel_id) => self.engine.open_channel(channel_id),
            NetCommand::CloseChannel => self.engine.close_channel(),
            NetCommand::LoadOlder => self
                .engine
                .begin_backfill()
                .map(SyncEvent::FetchPage)
                .into_iter()
                .collect(),
            NetCommand::Send {
                channel_id,
                content,
                parent_id,
            } => self
                .engine
                .send_message(channel_id, content, parent_id, now),
            NetCommand::Retry(temp_id) => self.engine.retry_send(temp_id, now),
            NetCommand::SetTyping(is_typing) => self.engine.set_typing(is_typing, now),
            NetCommand::ToggleReaction { message_id, emoji } => {
                self.engine.toggle_reaction(message_id, &emoji)
            }
            NetCommand::VisitBoard => self.engine.visit_board(),
            NetCommand::OpenDocument(document_id) => self.engine.open_document(document_id),
            NetCommand::SetMembers {
                channel_id,
                members,
            } => self.engine.set_members(channel_id, members),
            NetCommand::SetNotificationPrefs(prefs) => {
                self.engine.set_notification_prefs(prefs);
                Vec::new()
            }
            NetCommand::View { channel_id, reply } => {
                let _ = reply.send(self.engine.channel_view(channel_id, Instant::now()));
                Vec::new()
            }
            NetCommand::Channels { reply } => {
                let list = self
                    .engine
                    .channels()
                    .map(|c| (c.clone(), self.engine.unread(c.id)))
                    .collect();
                let _ = reply.send(list);
                Vec::new()
            }
            // Handled by the select loop.
            NetCommand::Shutdown => Vec::new(),
        };
        self.dispatch(events).await;
    }

    async fn on_completion(&mut self, done: Completion) {
        let events = match done {
            Completion::Page { request, result } => match result {
                Ok(page) => match self.engine.complete_page(request, page, Moment::now()) {
                    Ok(events) => events,
                    Err(stale) => {
                        tracing::debug!(err = %stale, "discarding history page");
                        Vec::new()
                    }
                },
                Err(e) => {
                    self.engine.page_failed(request);
                    self.emit(NetEvent::Error(format!("history fetch failed: {e}")))
                        .await;
                    Vec::new()
                }
            },
            Completion::Channels { ticket, result } => match result {
                Ok(list) => match self.engine.apply_channel_list(ticket, list) {
                    Ok(events) => {
                        self.snapshot_backoff.reset();
                        events
                    }
                    Err(stale) => {
                        tracing::debug!(err = %stale, "discarding channel list");
                        Vec::new()
                    }
                },
                Err(e) => {
                    self.emit(NetEvent::Error(format!("channel list fetch failed: {e}")))
                        .await;
                    if self.engine.snapshot_failed(ticket) {
                        self.schedule_channels_retry();
                    }
                    Vec::new()
                }
            },
            Completion::ChannelsRetryDue => {
                if self.engine.snapshot_pending() {
                    Vec::new()
                } else {
                    vec![SyncEvent::FetchChannels(self.engine.begin_snapshot())]
                }
            }
            Completion::Read { channel_id, result } => match result {
                Ok(confirmation) => self
                    .engine
                    .confirm_read(channel_id, confirmation.last_read_id),
                Err(e) => {
                    tracing::warn!(channel_id = %channel_id, err = %e, "mark read failed");
                    Vec::new()
                }
            },
            Completion::Reaction {
                message_id,
                emoji,
                add,
                result,
            } => match result {
                Ok(()) => Vec::new(),
                Err(e) => {
                    self.emit(NetEvent::Error(format!("reaction sync failed: {e}")))
                        .await;
                    self.engine.reaction_failed(message_id, &emoji, add)
                }
            },
        };
        self.dispatch(events).await;
    }

    /// Executes effects and forwards state changes, in order. Effects may
    /// yield further events (a failed transmit marks its message failed).
    async fn dispatch(&mut self, events: Vec<SyncEvent>) {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            if event.is_effect() {
                queue.extend(self.execute(event));
            } else {
                self.emit(NetEvent::Sync(event)).await;
            }
        }
    }

    fn execute(&mut self, effect: SyncEvent) -> Vec<SyncEvent> {
        match effect {
            SyncEvent::Transmit { frame, temp_id } => {
                if let Err(e) = self.connection.send(&frame) {
                    tracing::warn!(err = %e, "frame not sent");
                    if let Some(temp_id) = temp_id {
                        return self.engine.mark_send_failed(temp_id);
                    }
                }
            }
            SyncEvent::FetchPage(request) => {
                self.request(move |api| async move {
                    let result = api.fetch_history(request.channel_id, request.query).await;
                    Completion::Page { request, result }
                });
            }
            SyncEvent::FetchChannels(ticket) => {
                self.request(move |api| async move {
                    let result = api.list_channels().await;
                    Completion::Channels { ticket, result }
                });
            }
            SyncEvent::MarkReadRequested { channel_id } => {
                self.request(move |api| async move {
                    let result = api.mark_read(channel_id).await;
                    Completion::Read { channel_id, result }
                });
            }
            SyncEvent::SyncReaction {
                channel_id,
                message_id,
                emoji,
                add,
            } => {
                self.request(move |api| async move {
                    let result = if add {
                        api.add_reaction(channel_id, message_id, &emoji).await
                    } else {
                        api.remove_reaction(channel_id, message_id, &emoji).await
                    };
                    Completion::Reaction {
                        message_id,
                        emoji,
                        add,
                        result,
                    }
                });
            }
            other => tracing::warn!(event = ?other, "not an effect"),
        }
        Vec::new()
    }

    fn schedule_channels_retry(&mut self) {
        let delay = self.snapshot_backoff.next_delay();
        tracing::info!(
            delay = ?delay,
            failures = self.snapshot_backoff.failures(),
            "retrying channel list after backoff"
        );
        let done = self.completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = done.send(Completion::ChannelsRetryDue).await;
        });
    }

    /// Runs a REST call on its own task and feeds the result back.
    fn request<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<A>) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let done = self.completions.clone();
        let fut = call(Arc::clone(&self.api));
        tokio::spawn(async move {
            let _ = done.send(fut.await).await;
        });
    }

    async fn emit(&self, event: NetEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
