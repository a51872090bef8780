//! Shared protocol definitions for the Huddle realtime wire format.

pub mod decode;
pub mod event;
pub mod ids;
pub mod outbound;
pub mod rest;
