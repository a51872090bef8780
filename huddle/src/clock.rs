//! Explicit time for the sync engine.
//!
//! Every state-machine mutator takes a [`Moment`] instead of reading the
//! clock itself, so expiry windows and mute checks are deterministic in
//! tests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A paired monotonic and wall-clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    /// Monotonic time, used for expiry windows.
    pub instant: Instant,
    /// Wall-clock time, used for server-provided timestamps (mute windows).
    pub wall: DateTime<Utc>,
}

impl Moment {
    /// Reads both clocks now.
    #[must_use]
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// Returns a moment `by` later on both clocks.
    #[must_use]
    pub fn advanced(self, by: Duration) -> Self {
        let wall = chrono::Duration::from_std(by).map_or(self.wall, |d| self.wall + d);
        Self {
            instant: self.instant + by,
            wall,
        }
    }
}
