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

//! End-to-end scenarios for the sync engine, driven through its public API
//! with explicit time.
//!
//! These tests validate:
//! - Reconnect after an offline period merges queued messages without gaps
//!   or duplicates
//! - Unread counting and notification suppression follow the open channel
//! - An unknown event kind is rejected by the decoder and changes nothing
//! - Rapid duplicate reactions group to a single entry
//! - Optimistic sends reconcile to exactly one confirmed message
//! - Typing indicators expire and stale history pages are discarded

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::time::Instant;

use huddle::clock::Moment;
use huddle::sync::{
    Delivery, PagePurpose, PageRequest, SendState, Session, StaleResponse, SyncConfig, SyncEngine,
    SyncEvent,
};
use huddle_proto::decode::{self, DecodeError};
use huddle_proto::event::{ServerEvent, WireMessage, WireReaction};
use huddle_proto::ids::{ChannelId, MessageId, UserId};
use huddle_proto::outbound::ClientFrame;
use huddle_proto::rest::ChannelSummary;

const ME: UserId = UserId(1);
const BOB: UserId = UserId(2);
const A: ChannelId = ChannelId(10);
const B: ChannelId = ChannelId(20);

fn engine() -> SyncEngine {
    SyncEngine::new(
        Session {
            user_id: ME,
            username: "me".into(),
        },
        SyncConfig::default(),
    )
}

fn start() -> Moment {
    Moment {
        instant: Instant::now(),
        wall: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
    }
}

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

fn load_channels(engine: &mut SyncEngine, list: Vec<ChannelSummary>) {
    let ticket = engine.begin_snapshot();
    engine.apply_channel_list(ticket, list).unwrap();
}

fn fetch_request(events: &[SyncEvent]) -> PageRequest {
    events
        .iter()
        .find_map(|e| match e {
            SyncEvent::FetchPage(request) => Some(*request),
            _ => None,
        })
        .expect("a page request")
}

fn ids(engine: &SyncEngine, channel_id: ChannelId) -> Vec<i64> {
    engine
        .messages(channel_id)
        .iter()
        .map(|m| m.id.get())
        .collect()
}

fn notified(events: &[SyncEvent]) -> bool {
    events.iter().any(|e| matches!(e, SyncEvent::Notify(_)))
}

#[test]
fn reconnect_merges_messages_missed_while_offline() {
    let mut engine = engine();
    let now = start();
    engine.connection_changed(true);
    load_channels(&mut engine, vec![summary(A, 0)]);

    let opened = engine.open_channel(A);
    let request = fetch_request(&opened);
    engine
        .complete_page(
            request,
            vec![wire(1, A, BOB, "one"), wire(2, A, BOB, "two"), wire(3, A, BOB, "three")],
            now,
        )
        .unwrap();
    assert_eq!(ids(&engine, A), vec![1, 2, 3]);

    // Offline for ten seconds; three messages are posted meanwhile.
    engine.connection_changed(false);
    let later = now.advanced(Duration::from_secs(10));
    let events = engine.connection_changed(true);

    let ticket = events
        .iter()
        .find_map(|e| match e {
            SyncEvent::FetchChannels(ticket) => Some(*ticket),
            _ => None,
        })
        .expect("a snapshot request");
    let refresh = fetch_request(&events);
    assert_eq!(refresh.purpose, PagePurpose::Latest);
    assert_eq!(refresh.channel_id, A);

    engine.apply_channel_list(ticket, vec![summary(A, 0)]).unwrap();
    // The newest page overlaps what is already loaded.
    engine
        .complete_page(
            refresh,
            vec![
                wire(2, A, BOB, "two"),
                wire(3, A, BOB, "three"),
                wire(4, A, BOB, "four"),
                wire(5, A, BOB, "five"),
                wire(6, A, BOB, "six"),
            ],
            later,
        )
        .unwrap();

    assert_eq!(ids(&engine, A), vec![1, 2, 3, 4, 5, 6]);

    // A late live echo of a merged message changes nothing.
    let events = engine.handle_event(ServerEvent::NewMessage(wire(5, A, BOB, "five")), later);
    assert!(events.is_empty());
    assert_eq!(ids(&engine, A), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn unread_and_notifications_follow_the_open_channel() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 5), summary(B, 0)]);
    assert_eq!(engine.unread(A), 5);

    let opened = engine.open_channel(A);
    assert!(
        opened
            .iter()
            .any(|e| *e == SyncEvent::MarkReadRequested { channel_id: A })
    );
    engine.confirm_read(A, Some(MessageId(40)));
    assert_eq!(engine.unread(A), 0);

    let events = engine.handle_event(ServerEvent::NewMessage(wire(50, B, BOB, "over here")), now);
    assert_eq!(engine.unread(B), 1);
    assert!(notified(&events));

    let events = engine.handle_event(ServerEvent::NewMessage(wire(51, A, BOB, "in view")), now);
    assert_eq!(engine.unread(A), 0);
    assert!(!notified(&events));
    assert!(
        events
            .iter()
            .any(|e| *e == SyncEvent::MarkReadRequested { channel_id: A })
    );
    assert_eq!(engine.total_unread(), 1);
}

#[test]
fn unknown_event_kind_is_rejected_without_state_change() {
    let mut engine = engine();
    load_channels(&mut engine, vec![summary(A, 2)]);
    let before = engine.channel_view(A, Instant::now());

    let err = decode::decode(r#"{"type":"unknown_kind","channel_id":10}"#).unwrap_err();
    assert_eq!(err, DecodeError::UnknownKind("unknown_kind".into()));

    // Only decoded events reach the engine; the view is untouched.
    assert_eq!(engine.channel_view(A, Instant::now()), before);
    assert_eq!(engine.unread(A), 2);
}

#[test]
fn rapid_duplicate_reactions_group_once() {
    let mut engine = engine();
    let now = start();
    engine.handle_event(ServerEvent::NewMessage(wire(7, A, BOB, "ship it")), now);

    let reaction = ServerEvent::ReactionAdded {
        message_id: MessageId(7),
        reaction: WireReaction {
            user_id: ME,
            emoji: "🚀".into(),
            username: "me".into(),
            avatar_url: None,
        },
    };
    let first = engine.handle_event(reaction.clone(), now);
    let second = engine.handle_event(reaction, now);
    assert!(!first.is_empty());
    assert!(second.is_empty());

    let groups = engine.reaction_groups(MessageId(7));
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].emoji, "🚀");
    assert_eq!(groups[0].count, 1);
    assert!(groups[0].has_mine);
}

#[test]
fn optimistic_send_reconciles_to_one_confirmed_message() {
    let mut engine = engine();
    let now = start();
    engine.connection_changed(true);
    load_channels(&mut engine, vec![summary(A, 0)]);
    engine.open_channel(A);

    let events = engine.send_message(A, "hello".into(), None, now);
    let (nonce, temp_id) = events
        .iter()
        .find_map(|e| match e {
            SyncEvent::Transmit {
                frame: ClientFrame::Message { client_nonce, .. },
                temp_id: Some(temp_id),
            } => Some((*client_nonce, *temp_id)),
            _ => None,
        })
        .expect("a message frame");
    assert!(temp_id.is_temporary());
    assert_eq!(engine.messages(A).len(), 1);
    assert_eq!(
        engine.messages(A)[0].delivery,
        Delivery::Pending(SendState::Sending)
    );

    let mut echo = wire(77, A, ME, "hello");
    echo.client_nonce = Some(nonce);
    let events = engine.handle_event(ServerEvent::NewMessage(echo.clone()), now.advanced(Duration::from_millis(300)));
    assert!(events.contains(&SyncEvent::MessageConfirmed {
        channel_id: A,
        temp_id,
        id: MessageId(77),
    }));
    assert!(!notified(&events));

    // A second delivery of the same echo is a no-op.
    engine.handle_event(ServerEvent::NewMessage(echo), now.advanced(Duration::from_secs(1)));

    let messages = engine.messages(A);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId(77));
    assert_eq!(messages[0].delivery, Delivery::Confirmed);
    assert!(engine.message(temp_id).is_none());
}

#[test]
fn failed_send_stays_pending_until_retried() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 0)]);
    engine.open_channel(A);

    let events = engine.send_message(A, "offline".into(), None, now);
    let temp_id = events
        .iter()
        .find_map(|e| match e {
            SyncEvent::Transmit { temp_id, .. } => *temp_id,
            _ => None,
        })
        .unwrap();

    engine.mark_send_failed(temp_id);
    assert_eq!(
        engine.message(temp_id).unwrap().delivery,
        Delivery::Pending(SendState::Failed)
    );

    let retry = engine.retry_send(temp_id, now.advanced(Duration::from_secs(30)));
    assert!(retry.iter().any(|e| matches!(
        e,
        SyncEvent::Transmit {
            temp_id: Some(t),
            ..
        } if *t == temp_id
    )));
    assert_eq!(
        engine.message(temp_id).unwrap().delivery,
        Delivery::Pending(SendState::Sending)
    );
}

#[test]
fn typing_expires_without_refresh_and_stops_on_false() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 0)]);
    engine.open_channel(A);

    let typing = |is_typing| ServerEvent::Typing {
        user_id: BOB,
        full_name: "Bob Stone".into(),
        username: "bob".into(),
        is_typing,
        channel_id: Some(A),
    };

    engine.handle_event(typing(true), now);
    assert_eq!(engine.typing_names(A, now.instant), vec!["Bob Stone"]);

    let refreshed = now.advanced(Duration::from_secs(4));
    engine.handle_event(typing(true), refreshed);
    let still = now.advanced(Duration::from_secs(8));
    assert!(engine.tick(still).is_empty());
    assert_eq!(engine.typing_names(A, still.instant), vec!["Bob Stone"]);

    let expired = refreshed.advanced(Duration::from_secs(5));
    let events = engine.tick(expired);
    assert_eq!(events, vec![SyncEvent::TypingChanged { channel_id: A }]);
    assert!(engine.typing_names(A, expired.instant).is_empty());

    engine.handle_event(typing(true), expired);
    engine.handle_event(typing(false), expired);
    assert!(engine.typing_names(A, expired.instant).is_empty());
}

#[test]
fn history_page_for_a_left_channel_is_discarded() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 0), summary(B, 0)]);

    let request = fetch_request(&engine.open_channel(A));
    engine.open_channel(B);

    let result = engine.complete_page(request, vec![wire(1, A, BOB, "late")], now);
    assert_eq!(
        result,
        Err(StaleResponse::Page {
            channel_id: A,
            token: request.token,
        })
    );
    assert!(engine.messages(A).is_empty());
}

#[test]
fn short_page_exhausts_backfill() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 0)]);

    let request = fetch_request(&engine.open_channel(A));
    let events = engine
        .complete_page(request, vec![wire(1, A, BOB, "only")], now)
        .unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::PageMerged { outcome, .. } if outcome.exhausted && outcome.new_len == 1
    )));
    assert!(engine.begin_backfill().is_none());
}

#[test]
fn snapshot_replays_increments_made_while_it_was_in_flight() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 0), summary(B, 0)]);

    let ticket = engine.begin_snapshot();
    engine.handle_event(ServerEvent::NewMessage(wire(90, B, BOB, "during fetch")), now);
    engine
        .apply_channel_list(ticket, vec![summary(A, 0), summary(B, 2)])
        .unwrap();

    // Snapshot value plus the live increment recorded after the request.
    assert_eq!(engine.unread(B), 3);

    let superseded = engine.begin_snapshot();
    let latest = engine.begin_snapshot();
    assert!(engine.apply_channel_list(superseded, vec![summary(B, 0)]).is_err());
    engine.apply_channel_list(latest, vec![summary(A, 0), summary(B, 0)]).unwrap();
    assert_eq!(engine.unread(B), 0);
}

/// Answers a history query the way the server does: newest first, skipping
/// `offset` messages.
fn serve(newest: i64, request: PageRequest) -> Vec<WireMessage> {
    (1..=newest)
        .rev()
        .skip(request.query.offset as usize)
        .take(request.query.limit as usize)
        .map(|id| wire(id, A, BOB, "m"))
        .collect()
}

#[test]
fn backfilled_own_message_does_not_consume_failed_send() {
    let mut engine = engine();
    let now = start();
    load_channels(&mut engine, vec![summary(A, 0)]);
    let request = fetch_request(&engine.open_channel(A));
    engine.complete_page(request, serve(100, request), now).unwrap();

    let events = engine.send_message(A, "ancient".into(), None, now);
    let temp_id = events
        .iter()
        .find_map(|e| match e {
            SyncEvent::Transmit { temp_id, .. } => *temp_id,
            _ => None,
        })
        .unwrap();
    engine.mark_send_failed(temp_id);

    let request = engine.begin_backfill().unwrap();
    let mut page = serve(100, request);
    let old = page.iter_mut().find(|m| m.id == MessageId(5)).unwrap();
    old.user_id = ME;
    old.content = "ancient".into();
    engine.complete_page(request, page, now).unwrap();

    assert_eq!(engine.messages(A).iter().filter(|m| m.is_pending()).count(), 1);
    assert_eq!(
        engine.message(temp_id).unwrap().delivery,
        Delivery::Pending(SendState::Failed)
    );
    assert_eq!(engine.message(MessageId(5)).unwrap().author_id, ME);
}

#[test]
fn reconnect_after_long_outage_fills_the_gap_and_reaches_the_start() {
    let mut engine = engine();
    let now = start();
    engine.connection_changed(true);
    load_channels(&mut engine, vec![summary(A, 0)]);

    let request = fetch_request(&engine.open_channel(A));
    engine.complete_page(request, serve(100, request), now).unwrap();
    assert_eq!(ids(&engine, A), (51..=100).collect::<Vec<_>>());

    // 120 messages are posted while we are offline.
    engine.connection_changed(false);
    let events = engine.connection_changed(true);
    let refresh = fetch_request(&events);
    let mut pending = engine.complete_page(refresh, serve(220, refresh), now).unwrap();

    let mut rounds = 0;
    loop {
        let next = pending.iter().find_map(|e| match e {
            SyncEvent::FetchPage(request) => Some(*request),
            _ => None,
        });
        let Some(request) = next.or_else(|| engine.begin_backfill()) else {
            break;
        };
        pending = engine.complete_page(request, serve(220, request), now).unwrap();
        rounds += 1;
        assert!(rounds < 20, "backfill never reached the start of the channel");
    }

    assert_eq!(ids(&engine, A), (1..=220).collect::<Vec<_>>());
    assert!(engine.channel_view(A, now.instant).exhausted);
}
