//! `Huddle`: realtime chat synchronization engine.
//!
//! [`sync::SyncEngine`] reconciles server push events, REST snapshots and
//! optimistic local actions into one consistent view per channel.
//! [`transport`] keeps a single WebSocket alive, and [`net`] drives the
//! engine from it.

pub mod api;
pub mod clock;
pub mod config;
pub mod net;
pub mod sync;
pub mod transport;
