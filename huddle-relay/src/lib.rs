//! `Huddle` development server library.
//!
//! An in-memory chat backend speaking the realtime and REST protocols the
//! `huddle` client consumes. Exposed for tests and embedding.

pub mod config;
pub mod server;
pub mod state;
pub mod store;
