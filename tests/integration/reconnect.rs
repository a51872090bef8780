// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Driver tests over the in-process loopback transport and a fake REST API.
//!
//! These tests validate:
//! - Dropping the socket triggers a reconnect that refreshes the channel
//!   snapshot and the open channel's history
//! - Undecodable and unknown frames leave the connection open
//! - A send while disconnected is marked failed and delivered on retry
//! - A reaction rejected by the server is reverted
//! - Failed connect attempts back off and are retried
//! - A failed channel list fetch is retried
//! - Presence learned on a dropped link is forgotten on reconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use huddle::api::{ApiError, ChatApi};
use huddle::net::{self, NetCommand, NetConfig, NetEvent};
use huddle::sync::{ChannelView, Delivery, SendState, Session, SyncConfig, SyncEvent};
use huddle::transport::ConnectionState;
use huddle::transport::backoff::BackoffConfig;
use huddle::transport::connection::ConnectionConfig;
use huddle::transport::loopback::{self, LoopbackServer, ServerPeer};
use huddle_proto::event::{ServerEvent, WireMessage};
use huddle_proto::ids::{ChannelId, MessageId, UserId};
use huddle_proto::outbound::ClientFrame;
use huddle_proto::rest::{ChannelSummary, HistoryQuery, ReadConfirmation};

const ME: UserId = UserId(1);
const BOB: UserId = UserId(2);
const A: ChannelId = ChannelId(10);
const B: ChannelId = ChannelId(20);

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fake REST API
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeData {
    channels: Vec<ChannelSummary>,
    history: HashMap<ChannelId, Vec<WireMessage>>,
    list_calls: u32,
    failing_lists: u32,
    reject_reactions: bool,
}

#[derive(Clone, Default)]
struct FakeApi {
    data: Arc<Mutex<FakeData>>,
}

impl FakeApi {
    fn with_channels(channels: Vec<ChannelSummary>) -> Self {
        let api = Self::default();
        api.data.lock().channels = channels;
        api
    }

    fn set_history(&self, channel_id: ChannelId, messages: Vec<WireMessage>) {
        self.data.lock().history.insert(channel_id, messages);
    }

    fn list_calls(&self) -> u32 {
        self.data.lock().list_calls
    }
}

impl ChatApi for FakeApi {
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, ApiError> {
        let mut data = self.data.lock();
        data.list_calls += 1;
        if data.failing_lists > 0 {
            data.failing_lists -= 1;
            return Err(ApiError::Unavailable("channel list is down".into()));
        }
        Ok(data.channels.clone())
    }

    async fn fetch_history(
        &self,
        channel_id: ChannelId,
        query: HistoryQuery,
    ) -> Result<Vec<WireMessage>, ApiError> {
        let data = self.data.lock();
        let all = data.history.get(&channel_id).cloned().unwrap_or_default();
        let end = all.len().saturating_sub(query.offset as usize);
        let start = end.saturating_sub(query.limit as usize);
        Ok(all[start..end].to_vec())
    }

    async fn mark_read(&self, channel_id: ChannelId) -> Result<ReadConfirmation, ApiError> {
        let data = self.data.lock();
        let last_read_id = data
            .history
            .get(&channel_id)
            .and_then(|messages| messages.last())
            .map(|m| m.id);
        Ok(ReadConfirmation {
            channel_id,
            last_read_id,
        })
    }

    async fn add_reaction(
        &self,
        _channel_id: ChannelId,
        _message_id: MessageId,
        _emoji: &str,
    ) -> Result<(), ApiError> {
        if self.data.lock().reject_reactions {
            return Err(ApiError::Unavailable("reactions are disabled".into()));
        }
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _channel_id: ChannelId,
        _message_id: MessageId,
        _emoji: &str,
    ) -> Result<(), ApiError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn summary(id: ChannelId, unread: u32) -> ChannelSummary {
    ChannelSummary {
        id,
        name: format!("c{id}"),
        is_direct: false,
        unread_count: unread,
        mute_until: None,
        last_read_message_id: None,
        others_read_message_id: None,
        is_pinned: false,
        member_ids: vec![ME, BOB],
    }
}

fn wire(id: i64, channel_id: ChannelId, author: UserId, content: &str) -> WireMessage {
    WireMessage {
        id: MessageId(id),
        channel_id,
        user_id: author,
        content: content.into(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        parent_id: None,
        document_id: None,
        reactions: Vec::new(),
        username: Some("bob".into()),
        reply_count: 0,
        client_nonce: None,
    }
}

fn history(channel_id: ChannelId, ids: std::ops::RangeInclusive<i64>) -> Vec<WireMessage> {
    ids.map(|id| wire(id, channel_id, BOB, &format!("m{id}")))
        .collect()
}

fn fast_config() -> NetConfig {
    NetConfig {
        ws_url: Url::parse("ws://loopback.invalid/ws").unwrap(),
        api_url: Url::parse("http://loopback.invalid").unwrap(),
        token: "1".into(),
        session: Session {
            user_id: ME,
            username: "me".into(),
        },
        connection: ConnectionConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(50),
                jitter: 0.0,
                stable_after: Duration::from_secs(60),
            },
            ping_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
            ..ConnectionConfig::default()
        },
        sync: SyncConfig::default(),
        request_timeout: Duration::from_secs(1),
        tick_interval: Duration::from_millis(50),
        channel_capacity: 256,
    }
}

struct Harness {
    commands: mpsc::Sender<NetCommand>,
    events: mpsc::Receiver<NetEvent>,
    server: LoopbackServer,
    api: FakeApi,
}

fn start(api: FakeApi) -> Harness {
    start_failing(api, 0)
}

/// Starts the driver with the first `failures` connect attempts refused.
fn start_failing(api: FakeApi, failures: u32) -> Harness {
    let (connector, server) = loopback::pair(64);
    server.fail_next(failures);
    let (commands, events) = net::spawn_with(connector, api.clone(), fast_config());
    Harness {
        commands,
        events,
        server,
        api,
    }
}

impl Harness {
    async fn accept(&mut self) -> ServerPeer {
        tokio::time::timeout(WAIT, self.server.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Waits for the first event matching `pred`, discarding the rest.
    async fn wait_for(&mut self, mut pred: impl FnMut(&NetEvent) -> bool) -> NetEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("driver stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_sync(&mut self, mut pred: impl FnMut(&SyncEvent) -> bool) -> SyncEvent {
        match self
            .wait_for(|e| matches!(e, NetEvent::Sync(s) if pred(s)))
            .await
        {
            NetEvent::Sync(s) => s,
            other => unreachable!("filtered: {other:?}"),
        }
    }

    async fn view(&self, channel_id: ChannelId) -> ChannelView {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NetCommand::View { channel_id, reply })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn send(&self, command: NetCommand) {
        self.commands.send(command).await.unwrap();
    }
}

fn page_len(event: &SyncEvent, channel: ChannelId) -> Option<usize> {
    match event {
        SyncEvent::PageMerged {
            channel_id,
            outcome,
        } if *channel_id == channel => Some(outcome.new_len),
        _ => None,
    }
}

/// Receives the next message frame the client sent, skipping typing.
async fn next_message_frame(peer: &mut ServerPeer) -> ClientFrame {
    tokio::time::timeout(WAIT, async {
        loop {
            let text = peer.recv_text().await.expect("client closed the link");
            let frame: ClientFrame = serde_json::from_str(&text).unwrap();
            if matches!(frame, ClientFrame::Message { .. }) {
                return frame;
            }
        }
    })
    .await
    .expect("timed out waiting for a message frame")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_socket_reconnects_and_refreshes_open_channel() {
    let api = FakeApi::with_channels(vec![summary(A, 0), summary(B, 0)]);
    api.set_history(A, history(A, 1..=3));
    let mut h = start(api);

    let peer = h.accept().await;
    assert_eq!(peer.token, "1");
    h.wait_sync(|e| matches!(e, SyncEvent::ChannelsChanged))
        .await;

    h.send(NetCommand::OpenChannel(A)).await;
    let merged = h.wait_sync(|e| page_len(e, A).is_some()).await;
    assert_eq!(page_len(&merged, A), Some(3));

    // Messages 4..=6 arrive while the socket is down.
    h.api.set_history(A, history(A, 1..=6));
    drop(peer);

    let _peer = h.accept().await;
    h.wait_for(|e| matches!(e, NetEvent::Connection(s) if s.epoch == 2))
        .await;
    let merged = h.wait_sync(|e| page_len(e, A).is_some()).await;
    assert_eq!(page_len(&merged, A), Some(6));

    let ids: Vec<i64> = h.view(A).await.messages.iter().map(|m| m.id.get()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    assert!(h.server.attempts() >= 2);
    assert!(h.api.list_calls() >= 2);
}

#[tokio::test]
async fn bad_frames_keep_the_connection_open() {
    let mut h = start(FakeApi::with_channels(vec![summary(A, 0), summary(B, 0)]));
    let peer = h.accept().await;
    h.wait_sync(|e| matches!(e, SyncEvent::ChannelsChanged))
        .await;

    assert!(peer.push_text(r#"{"type":"unknown_kind","x":1}"#));
    assert!(peer.push_text("not json at all"));
    assert!(peer.push_text(r#"{"type":"new_message","id":"seven"}"#));
    let event = ServerEvent::NewMessage(wire(7, B, BOB, "still here"));
    assert!(peer.push_text(serde_json::to_string(&event).unwrap()));

    let next = h
        .wait_for(|e| {
            matches!(
                e,
                NetEvent::Sync(SyncEvent::UnreadChanged { channel_id: B, .. })
                    | NetEvent::Connection(_)
            )
        })
        .await;
    assert!(
        matches!(
            next,
            NetEvent::Sync(SyncEvent::UnreadChanged {
                channel_id: B,
                count: 1
            })
        ),
        "unexpected event: {next:?}"
    );
    assert_eq!(h.server.attempts(), 1);
}

#[tokio::test]
async fn send_while_disconnected_fails_then_retry_delivers() {
    let mut h = start_failing(FakeApi::with_channels(vec![summary(A, 0)]), u32::MAX);

    h.send(NetCommand::OpenChannel(A)).await;
    h.send(NetCommand::Send {
        channel_id: A,
        content: "hello".into(),
        parent_id: None,
    })
    .await;

    // Pending first, then failed once the transmit is refused.
    let failed = tokio::time::timeout(WAIT, async {
        loop {
            let view = h.view(A).await;
            if let Some(m) = view
                .messages
                .iter()
                .find(|m| m.delivery == Delivery::Pending(SendState::Failed))
            {
                return m.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never marked failed");
    assert!(failed.id.is_temporary());
    assert_eq!(failed.body, "hello");

    h.server.fail_next(0);
    let mut peer = h.accept().await;
    h.wait_for(|e| matches!(e, NetEvent::Connection(s) if s.state == ConnectionState::Connected))
        .await;

    h.send(NetCommand::Retry(failed.id)).await;
    let ClientFrame::Message {
        channel_id,
        content,
        client_nonce,
        ..
    } = next_message_frame(&mut peer).await
    else {
        unreachable!("filtered to message frames");
    };
    assert_eq!(channel_id, A);
    assert_eq!(content, "hello");

    let mut echo = wire(42, A, ME, "hello");
    echo.username = Some("me".into());
    echo.client_nonce = Some(client_nonce);
    assert!(peer.push_text(serde_json::to_string(&ServerEvent::NewMessage(echo)).unwrap()));

    let confirmed = h
        .wait_sync(|e| matches!(e, SyncEvent::MessageConfirmed { .. }))
        .await;
    assert!(matches!(
        confirmed,
        SyncEvent::MessageConfirmed { temp_id, id: MessageId(42), .. } if temp_id == failed.id
    ));

    let view = h.view(A).await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].id, MessageId(42));
    assert_eq!(view.messages[0].delivery, Delivery::Confirmed);
}

#[tokio::test]
async fn rejected_reaction_is_reverted() {
    let api = FakeApi::with_channels(vec![summary(A, 0)]);
    api.set_history(A, history(A, 1..=2));
    api.data.lock().reject_reactions = true;
    let mut h = start(api);

    let _peer = h.accept().await;
    h.wait_sync(|e| matches!(e, SyncEvent::ChannelsChanged))
        .await;
    h.send(NetCommand::OpenChannel(A)).await;
    h.wait_sync(|e| page_len(e, A).is_some()).await;

    h.send(NetCommand::ToggleReaction {
        message_id: MessageId(2),
        emoji: "👍".into(),
    })
    .await;

    let error = h.wait_for(|e| matches!(e, NetEvent::Error(_))).await;
    assert!(matches!(error, NetEvent::Error(text) if text.contains("reaction")));
    h.wait_sync(|e| {
        matches!(e, SyncEvent::ReactionsChanged { message_id: MessageId(2), .. })
    })
    .await;

    let view = h.view(A).await;
    let message = view.messages.iter().find(|m| m.id == MessageId(2)).unwrap();
    assert!(message.reactions.is_empty());
}

#[tokio::test]
async fn failed_connects_back_off_and_retry() {
    let mut h = start_failing(FakeApi::with_channels(vec![summary(A, 0)]), 3);

    let _peer = h.accept().await;
    h.wait_for(|e| matches!(e, NetEvent::Connection(s) if s.state == ConnectionState::Connected))
        .await;

    assert!(h.server.attempts() >= 4);
    assert!(h.server.tokens().iter().all(|t| t == "1"));
}

#[tokio::test]
async fn failed_channel_list_is_retried() {
    let api = FakeApi::with_channels(vec![summary(A, 3)]);
    api.data.lock().failing_lists = 1;
    let mut h = start(api);
    let _peer = h.accept().await;

    let error = h.wait_for(|e| matches!(e, NetEvent::Error(_))).await;
    assert!(matches!(error, NetEvent::Error(text) if text.contains("channel list")));
    h.wait_sync(|e| matches!(e, SyncEvent::ChannelsChanged))
        .await;
    assert_eq!(h.api.list_calls(), 2);

    let (reply, rx) = oneshot::channel();
    h.send(NetCommand::Channels { reply }).await;
    let channels = rx.await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].0.id, A);
    assert_eq!(channels[0].1, 3);
}

#[tokio::test]
async fn presence_from_a_dropped_link_is_forgotten() {
    let mut h = start(FakeApi::with_channels(vec![summary(A, 0)]));
    let peer = h.accept().await;
    h.wait_sync(|e| matches!(e, SyncEvent::ChannelsChanged))
        .await;

    let online = ServerEvent::UserPresence {
        user_id: BOB,
        status: huddle_proto::event::PresenceStatus::Online,
        last_seen: None,
    };
    assert!(peer.push_text(serde_json::to_string(&online).unwrap()));
    h.wait_sync(|e| matches!(e, SyncEvent::OnlineCountChanged { channel_id: A, count: 1 }))
        .await;

    // Bob leaves while we are disconnected; the offline event is never seen.
    drop(peer);
    let _peer = h.accept().await;
    h.wait_sync(|e| matches!(e, SyncEvent::OnlineCountChanged { channel_id: A, count: 0 }))
        .await;
    let channel = h.view(A).await.channel.unwrap();
    assert_eq!(channel.online_count, 0);
}
