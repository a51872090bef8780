//! Unread counters and the document-share unread index.
//!
//! Counters move by live events and are replaced wholesale by a server
//! snapshot. A snapshot is requested with a [`SnapshotTicket`]; every
//! counter operation performed while that request is in flight is recorded
//! and replayed on top of the snapshot when it lands. The snapshot may
//! already include some of those events, so a channel can over-count by at
//! most the number of events in flight.

use std::collections::{BTreeMap, HashMap};

use huddle_proto::ids::{ChannelId, DocumentId};

use super::StaleResponse;

/// Identifies one outstanding snapshot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTicket(u64);

#[derive(Debug, Clone, Copy)]
enum UnreadOp {
    Increment(ChannelId),
    Clear(ChannelId),
}

#[derive(Debug)]
struct Journal {
    ticket: u64,
    ops: Vec<UnreadOp>,
}

/// Per-channel unread counts plus shared-but-unopened documents.
#[derive(Debug, Default)]
pub struct UnreadTracker {
    counts: HashMap<ChannelId, u32>,
    documents: BTreeMap<DocumentId, ChannelId>,
    next_ticket: u64,
    journal: Option<Journal>,
}

impl UnreadTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more unread message in a channel. Returns the new count.
    pub fn increment(&mut self, channel_id: ChannelId) -> u32 {
        self.record(UnreadOp::Increment(channel_id));
        bump(&mut self.counts, channel_id)
    }

    /// Resets a channel to zero. Returns whether the count changed.
    pub fn clear(&mut self, channel_id: ChannelId) -> bool {
        self.record(UnreadOp::Clear(channel_id));
        self.counts.remove(&channel_id).is_some_and(|c| c > 0)
    }

    /// Unread count of a channel.
    #[must_use]
    pub fn count(&self, channel_id: ChannelId) -> u32 {
        self.counts.get(&channel_id).copied().unwrap_or(0)
    }

    /// Sum over all channels.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Starts a snapshot request. Any earlier outstanding ticket goes stale.
    pub fn begin_snapshot(&mut self) -> SnapshotTicket {
        self.next_ticket += 1;
        self.journal = Some(Journal {
            ticket: self.next_ticket,
            ops: Vec::new(),
        });
        SnapshotTicket(self.next_ticket)
    }

    /// Stops journaling for a snapshot request that failed. Returns `false`
    /// if `ticket` was not the outstanding request.
    pub fn abandon_snapshot(&mut self, ticket: SnapshotTicket) -> bool {
        if self.journal.as_ref().is_some_and(|j| j.ticket == ticket.0) {
            self.journal = None;
            true
        } else {
            false
        }
    }

    /// Whether a snapshot request is outstanding.
    #[must_use]
    pub const fn snapshot_pending(&self) -> bool {
        self.journal.is_some()
    }

    /// Replaces all counters with `snapshot`, then replays the operations
    /// recorded since `ticket` was issued.
    ///
    /// Returns the channels whose count changed.
    ///
    /// # Errors
    ///
    /// Returns [`StaleResponse::Snapshot`] if a newer snapshot was requested
    /// after `ticket`, or the ticket was already applied.
    pub fn sync_from_snapshot(
        &mut self,
        ticket: SnapshotTicket,
        snapshot: impl IntoIterator<Item = (ChannelId, u32)>,
    ) -> Result<Vec<ChannelId>, StaleResponse> {
        let journal = match self.journal.take() {
            Some(journal) if journal.ticket == ticket.0 => journal,
            other => {
                self.journal = other;
                return Err(StaleResponse::Snapshot { ticket: ticket.0 });
            }
        };

        let mut next: HashMap<ChannelId, u32> = snapshot
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .collect();
        for op in &journal.ops {
            match *op {
                UnreadOp::Increment(channel_id) => {
                    bump(&mut next, channel_id);
                }
                UnreadOp::Clear(channel_id) => {
                    next.remove(&channel_id);
                }
            }
        }
        if !journal.ops.is_empty() {
            tracing::debug!(
                replayed = journal.ops.len(),
                "replayed unread operations recorded during snapshot fetch"
            );
        }

        let mut changed: Vec<ChannelId> = self
            .counts
            .keys()
            .chain(next.keys())
            .copied()
            .filter(|ch| self.counts.get(ch) != next.get(ch))
            .collect();
        changed.sort_unstable();
        changed.dedup();
        self.counts = next;
        Ok(changed)
    }

    /// Records a document shared into a channel. Returns `false` if it was
    /// already unread.
    pub fn mark_document_shared(&mut self, document_id: DocumentId, channel_id: ChannelId) -> bool {
        self.documents.insert(document_id, channel_id).is_none()
    }

    /// Marks one document as opened.
    pub fn clear_document(&mut self, document_id: DocumentId) -> bool {
        self.documents.remove(&document_id).is_some()
    }

    /// Clears every document-share unread (the board view was visited).
    pub fn clear_documents(&mut self) -> bool {
        let had_any = !self.documents.is_empty();
        self.documents.clear();
        had_any
    }

    /// Number of shared documents not opened yet.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn record(&mut self, op: UnreadOp) {
        if let Some(journal) = self.journal.as_mut() {
            journal.ops.push(op);
        }
    }
}

fn bump(counts: &mut HashMap<ChannelId, u32>, channel_id: ChannelId) -> u32 {
    let count = counts.entry(channel_id).or_insert(0);
    *count = count.saturating_add(1);
    *count
}
