//! Strongly typed identifiers shared by every Huddle component.
//!
//! All identifiers are server-assigned `i64` values. Message ids are
//! monotonic within a channel; a negative [`MessageId`] marks a message the
//! client inserted optimistically before the server assigned a real id.

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Returns the raw numeric value.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a chat channel (direct or group).
    ChannelId
);
id_type!(
    /// Identifies a message. Negative values are client-side temporary ids.
    MessageId
);
id_type!(
    /// Identifies a user account.
    UserId
);
id_type!(
    /// Identifies a shared document on the board.
    DocumentId
);

impl MessageId {
    /// Whether this id was allocated locally for an unconfirmed message.
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        self.0 < 0
    }
}
