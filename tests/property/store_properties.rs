//! Property-based tests for the client-side message and reaction stores.
//!
//! Uses proptest to verify:
//! 1. Any sequence of live messages and history pages leaves a channel
//!    ordered by id with no duplicates.
//! 2. Re-applying an already stored message never changes the store.
//! 3. Optimistic sends and their echoes, interleaved with other traffic,
//!    reconcile to exactly one confirmed message each.
//! 4. Reaction sets behave as sets under any add/remove sequence, and
//!    display groups account for every reaction exactly once.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tokio::time::Instant;

use huddle::sync::{Applied, Delivery, MessageStore, Reaction, ReactionSet};
use huddle_proto::event::WireMessage;
use huddle_proto::ids::{ChannelId, MessageId, UserId};

const ME: UserId = UserId(1);
const OTHER: UserId = UserId(2);
const CH: ChannelId = ChannelId(5);
const PAGE_SIZE: usize = 10;

fn wire(id: i64, author: UserId) -> WireMessage {
    WireMessage {
        id: MessageId(id),
        channel_id: CH,
        user_id: author,
        content: format!("m{id}"),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        parent_id: None,
        document_id: None,
        reactions: Vec::new(),
        username: None,
        reply_count: 0,
        client_nonce: None,
    }
}

fn store() -> MessageStore {
    MessageStore::new(ME, Duration::from_secs(10))
}

fn ids(store: &MessageStore) -> Vec<i64> {
    store.messages(CH).iter().map(|m| m.id.get()).collect()
}

/// One way a message can reach the store.
#[derive(Debug, Clone)]
enum Delivered {
    Live(i64),
    Page(Vec<i64>),
}

fn arb_delivery() -> impl Strategy<Value = Delivered> {
    prop_oneof![
        (1i64..60).prop_map(Delivered::Live),
        prop::collection::vec(1i64..60, 0..PAGE_SIZE).prop_map(|mut page| {
            page.sort_unstable();
            page.dedup();
            Delivered::Page(page)
        }),
    ]
}

/// One step of a reaction toggle sequence.
#[derive(Debug, Clone)]
enum ReactionOp {
    Add(i64, &'static str),
    Remove(i64, &'static str),
}

fn arb_reaction_op() -> impl Strategy<Value = ReactionOp> {
    let emoji = prop::sample::select(vec!["👍", "🎉", "👀"]);
    prop_oneof![
        (1i64..5, emoji.clone()).prop_map(|(u, e)| ReactionOp::Add(u, e)),
        (1i64..5, emoji).prop_map(|(u, e)| ReactionOp::Remove(u, e)),
    ]
}

fn reaction(user: i64, emoji: &str) -> Reaction {
    Reaction {
        user_id: UserId(user),
        emoji: emoji.into(),
        username: format!("user{user}"),
        avatar_url: None,
    }
}

proptest! {
    #[test]
    fn channel_stays_ordered_and_unique(deliveries in prop::collection::vec(arb_delivery(), 1..30)) {
        let mut store = store();
        let now = Instant::now();
        let mut expected = BTreeSet::new();

        for delivery in deliveries {
            match delivery {
                Delivered::Live(id) => {
                    store.reconcile_server_message(wire(id, OTHER), now);
                    expected.insert(id);
                }
                Delivered::Page(page) => {
                    let before = expected.len();
                    expected.extend(page.iter().copied());
                    let outcome = store.merge_page(
                        CH,
                        page.into_iter().map(|id| wire(id, OTHER)).collect(),
                        PAGE_SIZE,
                        now,
                    );
                    prop_assert_eq!(outcome.inserted, expected.len() - before);
                    prop_assert_eq!(outcome.new_len, outcome.old_len + outcome.inserted);
                }
            }
        }

        prop_assert_eq!(ids(&store), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn reapplying_a_stored_message_is_a_noop(
        first in prop::collection::vec(1i64..40, 1..20),
        replay in prop::collection::vec(any::<prop::sample::Index>(), 1..20),
    ) {
        let mut store = store();
        let now = Instant::now();
        for id in &first {
            store.reconcile_server_message(wire(*id, OTHER), now);
        }
        let snapshot = ids(&store);

        for index in replay {
            let id = *index.get(&first);
            prop_assert_eq!(
                store.reconcile_server_message(wire(id, OTHER), now),
                Applied::Duplicate
            );
        }
        prop_assert_eq!(ids(&store), snapshot);
    }

    #[test]
    fn every_echo_reconciles_exactly_one_send(
        sends in 1usize..8,
        others in prop::collection::vec(100i64..200, 0..10),
        seed in any::<u64>(),
    ) {
        let mut store = store();
        let now = Instant::now();
        let wall = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

        let pending: Vec<_> = (0..sends)
            .map(|i| store.apply_optimistic_send(CH, format!("s{i}"), None, now, wall))
            .collect();
        let temp_ids: HashSet<MessageId> = pending.iter().map(|p| p.temp_id).collect();
        prop_assert_eq!(temp_ids.len(), sends);
        prop_assert!(temp_ids.iter().all(|id| id.is_temporary()));

        // Echoes get ids 1..=sends; other traffic is interleaved by `seed`.
        let mut arrivals: Vec<WireMessage> = pending
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut echo = wire(i as i64 + 1, ME);
                echo.content = format!("s{i}");
                echo.client_nonce = Some(p.nonce);
                echo
            })
            .chain(others.iter().map(|id| wire(*id, OTHER)))
            .collect();
        let len = arrivals.len();
        for i in 0..len {
            let j = (seed.rotate_left(i as u32) as usize) % len;
            arrivals.swap(i, j);
        }

        let mut reconciled = HashSet::new();
        for message in arrivals {
            if let Applied::Reconciled { temp_id } = store.reconcile_server_message(message, now) {
                prop_assert!(reconciled.insert(temp_id));
            }
        }

        prop_assert_eq!(reconciled, temp_ids);
        prop_assert!(store.pending(CH).is_empty());
        let mine = store
            .messages(CH)
            .into_iter()
            .filter(|m| m.author_id == ME)
            .inspect(|m| assert_eq!(m.delivery, Delivery::Confirmed))
            .count();
        prop_assert_eq!(mine, sends);
    }

    #[test]
    fn reaction_set_matches_set_model(ops in prop::collection::vec(arb_reaction_op(), 0..40)) {
        let mut set = ReactionSet::new();
        let mut model: HashSet<(i64, &'static str)> = HashSet::new();

        for op in ops {
            match op {
                ReactionOp::Add(user, emoji) => {
                    prop_assert_eq!(set.add(reaction(user, emoji)), model.insert((user, emoji)));
                }
                ReactionOp::Remove(user, emoji) => {
                    prop_assert_eq!(set.remove(UserId(user), emoji), model.remove(&(user, emoji)));
                }
            }
        }

        prop_assert_eq!(set.len(), model.len());
        for (user, emoji) in &model {
            prop_assert!(set.contains(UserId(*user), emoji));
        }

        let groups = set.group_for_display(ME);
        prop_assert_eq!(groups.iter().map(|g| g.count).sum::<usize>(), model.len());
        for group in &groups {
            prop_assert_eq!(group.count, group.user_ids.len());
            prop_assert_eq!(group.has_mine, group.user_ids.contains(&ME));
        }
        let emojis: HashSet<&str> = groups.iter().map(|g| g.emoji.as_str()).collect();
        prop_assert_eq!(emojis.len(), groups.len());
    }
}
