//! Inbound frame decoding against recorded fixtures, plus properties.
//!
//! Verifies:
//! 1. Every fixture event decodes, and together they cover every kind.
//! 2. Every rejected fixture fails with the expected error class.
//! 3. Arbitrary text never causes a panic in `decode`.
//! 4. A `type` outside the known set is always `UnknownKind`.
//! 5. Decoded events re-encode to the same `type` discriminator.

use std::collections::BTreeSet;

use proptest::prelude::*;
use serde_json::{Value, json};

use huddle_proto::decode::{self, DecodeError};
use huddle_proto::event::{PresenceStatus, ServerEvent};
use huddle_proto::ids::{ChannelId, MessageId, UserId};

const SERVER_EVENTS: &str = include_str!("../fixtures/server_events.json");
const REJECTED_FRAMES: &str = include_str!("../fixtures/rejected_frames.json");

fn server_events() -> Vec<Value> {
    serde_json::from_str(SERVER_EVENTS).unwrap()
}

fn error_class(err: &DecodeError) -> &'static str {
    match err {
        DecodeError::NotJson(_) => "not_json",
        DecodeError::MissingType => "missing_type",
        DecodeError::UnknownKind(_) => "unknown_kind",
        DecodeError::InvalidShape { .. } => "invalid_shape",
    }
}

#[test]
fn fixture_events_cover_every_kind() {
    let mut seen = BTreeSet::new();
    for value in server_events() {
        let raw = value.to_string();
        let event = decode::decode(&raw).unwrap_or_else(|e| panic!("{raw}: {e}"));
        seen.insert(event.kind());
    }
    let all: BTreeSet<&str> = ServerEvent::KINDS.into_iter().collect();
    assert_eq!(seen, all);
}

#[test]
fn fixture_fields_decode_faithfully() {
    let events: Vec<ServerEvent> = server_events()
        .into_iter()
        .map(|v| decode::decode_value(v).unwrap())
        .collect();

    let ServerEvent::NewMessage(first) = &events[0] else {
        panic!("expected new_message, got {:?}", events[0]);
    };
    assert_eq!(first.id, MessageId(101));
    assert_eq!(first.username.as_deref(), Some("bob"));
    assert_eq!(first.reactions.len(), 1);
    assert_eq!(first.reactions[0].avatar_url, None);
    assert_eq!(first.reply_count, 0);

    let ServerEvent::NewMessage(reply) = &events[1] else {
        panic!("expected new_message, got {:?}", events[1]);
    };
    assert_eq!(reply.parent_id, Some(MessageId(101)));
    assert!(reply.client_nonce.is_some());
    assert_eq!(reply.username, None);

    let unscoped_typing = events
        .iter()
        .find(|e| matches!(e, ServerEvent::Typing { is_typing: false, .. }))
        .unwrap();
    assert!(matches!(
        unscoped_typing,
        ServerEvent::Typing { channel_id: None, full_name, .. } if full_name.is_empty()
    ));

    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::UserPresence {
            user_id: UserId(3),
            status: PresenceStatus::Offline,
            last_seen: Some(_),
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Presence {
            online_count: 4,
            channel_id: Some(ChannelId(7)),
        }
    )));
}

#[test]
fn rejected_fixtures_fail_with_expected_class() {
    let cases: Vec<Value> = serde_json::from_str(REJECTED_FRAMES).unwrap();
    assert!(!cases.is_empty());
    for case in cases {
        let frame = case["frame"].as_str().unwrap();
        let expected = case["error"].as_str().unwrap();
        let err = decode::decode(frame).expect_err(frame);
        assert_eq!(error_class(&err), expected, "frame {frame:?} gave {err}");
    }
}

#[test]
fn binary_frames_decode_like_text() {
    let raw = r#"{"type":"message_deleted","message_id":5}"#;
    assert_eq!(
        decode::decode_bytes(raw.as_bytes()).unwrap(),
        decode::decode(raw).unwrap()
    );
    assert!(matches!(
        decode::decode_bytes(&[0xff, 0xfe, 0x00]),
        Err(DecodeError::NotJson(_))
    ));
}

proptest! {
    #[test]
    fn decode_never_panics_on_arbitrary_text(raw in any::<String>()) {
        let _ = decode::decode(&raw);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(raw in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode::decode_bytes(&raw);
    }

    #[test]
    fn unknown_type_is_always_unknown_kind(kind in "[a-z_]{1,24}", n in any::<i64>()) {
        prop_assume!(!ServerEvent::KINDS.contains(&kind.as_str()));
        let frame = json!({ "type": kind.clone(), "message_id": n }).to_string();
        prop_assert_eq!(decode::decode(&frame), Err(DecodeError::UnknownKind(kind)));
    }

    #[test]
    fn known_kind_with_random_fields_never_panics(
        index in 0..ServerEvent::KINDS.len(),
        id in any::<i64>(),
        flag in any::<bool>(),
        text in ".{0,16}",
    ) {
        let kind = ServerEvent::KINDS[index];
        let frame = json!({
            "type": kind,
            "id": id,
            "message_id": id,
            "user_id": text.clone(),
            "is_typing": flag,
            "online_count": id,
        });
        match decode::decode_value(frame) {
            Ok(event) => prop_assert_eq!(event.kind(), kind),
            Err(err) => prop_assert_eq!(err.kind(), Some(kind)),
        }
    }

    #[test]
    fn message_deleted_reencodes_with_same_kind(id in any::<i64>()) {
        let event = decode::decode(&json!({ "type": "message_deleted", "message_id": id }).to_string()).unwrap();
        let value = serde_json::to_value(&event).unwrap();
        prop_assert_eq!(value["type"].as_str(), Some("message_deleted"));
        prop_assert_eq!(event, ServerEvent::MessageDeleted { message_id: MessageId(id) });
    }
}
