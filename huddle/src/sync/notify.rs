//! Maps "something happened for me" into toast, sound and OS notification
//! side effects.
//!
//! The router knows nothing about chat. Any module that wants to notify the
//! user builds a [`Trigger`] and lets [`NotificationRouter::route`] apply
//! mute windows, self-authorship and "already looking at it" suppression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use huddle_proto::ids::ChannelId;

/// What produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// A chat message.
    Message,
    /// A document shared into a channel.
    DocumentShared,
    /// Anything routed in from outside chat (mail, tasks, ...).
    External,
}

impl TriggerKind {
    /// Whether viewing the originating channel makes the notification
    /// redundant.
    const fn suppressed_while_viewing(self) -> bool {
        matches!(self, Self::Message)
    }
}

/// Input to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Origin kind.
    pub kind: TriggerKind,
    /// Originating channel, if any.
    pub channel_id: Option<ChannelId>,
    /// Mute window of the originating channel.
    pub mute_until: Option<DateTime<Utc>>,
    /// The user is looking at the originating channel right now.
    pub viewing: bool,
    /// The user caused this event.
    pub self_authored: bool,
    /// The user was mentioned by name.
    pub is_mention: bool,
    /// Short heading.
    pub title: String,
    /// Body text.
    pub body: String,
}

/// How long a toast stays on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    /// Dismissed after the usual delay.
    Standard,
    /// Stays until dismissed. Used for mentions.
    Persistent,
}

/// Fan-out decided for one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Origin kind.
    pub kind: TriggerKind,
    /// Originating channel, if any.
    pub channel_id: Option<ChannelId>,
    /// Short heading.
    pub title: String,
    /// Body text.
    pub body: String,
    /// In-app toast, if any.
    pub toast: Option<ToastKind>,
    /// Play the notification sound.
    pub sound: bool,
    /// Raise an OS-level notification.
    pub os: bool,
}

/// User notification preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPrefs {
    /// Show in-app toasts.
    pub toasts: bool,
    /// Play a sound.
    pub sound: bool,
    /// Send OS notifications.
    pub os_enabled: bool,
    /// The OS granted notification permission.
    pub os_permission: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            toasts: true,
            sound: true,
            os_enabled: false,
            os_permission: false,
        }
    }
}

/// Applies [`NotificationPrefs`] to triggers.
#[derive(Debug, Clone, Default)]
pub struct NotificationRouter {
    prefs: NotificationPrefs,
}

impl NotificationRouter {
    /// Creates a router with the given preferences.
    #[must_use]
    pub const fn new(prefs: NotificationPrefs) -> Self {
        Self { prefs }
    }

    /// Replaces the preferences.
    pub const fn set_prefs(&mut self, prefs: NotificationPrefs) {
        self.prefs = prefs;
    }

    /// Decides the side effects of `trigger`, or `None` if it is suppressed.
    #[must_use]
    pub fn route(&self, trigger: Trigger, now: DateTime<Utc>) -> Option<Notification> {
        if trigger.mute_until.is_some_and(|until| until > now) {
            tracing::trace!(channel_id = ?trigger.channel_id, "notification suppressed: muted");
            return None;
        }
        if trigger.self_authored {
            return None;
        }
        if trigger.viewing && trigger.kind.suppressed_while_viewing() {
            return None;
        }

        let toast = if trigger.is_mention {
            Some(ToastKind::Persistent)
        } else if self.prefs.toasts {
            Some(ToastKind::Standard)
        } else {
            None
        };
        let sound = self.prefs.sound;
        let os = self.prefs.os_enabled && self.prefs.os_permission;
        if toast.is_none() && !sound && !os {
            return None;
        }

        Some(Notification {
            kind: trigger.kind,
            channel_id: trigger.channel_id,
            title: trigger.title,
            body: trigger.body,
            toast,
            sound,
            os,
        })
    }
}

/// Whether `body` mentions `@username` as a whole word (ASCII
/// case-insensitive).
#[must_use]
pub fn mentions(body: &str, username: &str) -> bool {
    if username.is_empty() {
        return false;
    }
    let needle = format!("@{}", username.to_lowercase());
    let haystack = body.to_lowercase();
    haystack.match_indices(&needle).any(|(at, _)| {
        let before = haystack[..at].chars().next_back();
        let after = haystack[at + needle.len()..].chars().next();
        before.is_none_or(|c| !is_word_char(c)) && after.is_none_or(|c| !is_word_char(c))
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
