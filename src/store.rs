//! # Message Reconciliation Store
//!
//! One ordered timeline per channel, merged from three sources:
//!
//! 1. **Optimistic** entries recorded the moment the local user sends.
//! 2. **Pushed** entries delivered in real time by the server.
//! 3. **History** batches fetched once per channel per session.
//!
//! ## Dedup rule
//! Two entries are the same message when the body matches exactly, both carry
//! the same sender user id, and their local arrival times differ by less than
//! the dedup window. A push matching an optimistic entry confirms it in place;
//! a push matching a confirmed entry is a redelivery and is dropped.
//!
//! Two identical messages sent by the same user inside the window cannot be
//! told apart. Pushes confirm the earliest matching optimistic entry first,
//! so in the common case each echo confirms its own send, but a redelivered
//! echo can confirm a later identical send.
//!
//! ## Snapshots
//! Timelines are `Arc<Vec<Message>>`. Every mutation produces a new vector
//! when the old one is shared, so a reader holding a [`Timeline`] never sees
//! a half-applied update.
//!
//! Timelines are never trimmed; they live until [`MessageStore::clear`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::protocol::{ChannelId, Message, MessageId, Provenance};

/// Immutable snapshot of one channel's timeline, oldest first.
pub type Timeline = Arc<Vec<Message>>;

/// What `record_pushed` did with an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// No match; appended at `index`.
    Appended { index: usize },
    /// Replaced the optimistic entry `replaced` at `index`.
    Confirmed { index: usize, replaced: MessageId },
    /// Redelivery of the confirmed entry at `index`; dropped.
    Duplicate { index: usize },
}

/// Result of asking to start a history load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginLoad {
    /// Caller should fetch.
    Started,
    /// History for this channel is already in the timeline.
    AlreadyLoaded,
    /// A fetch is already running.
    InFlight,
}

#[derive(Debug)]
pub struct MessageStore {
    dedup_window_ms: i64,
    timelines: HashMap<ChannelId, Timeline>,
    loading: HashSet<ChannelId>,
    loaded: HashSet<ChannelId>,
}

/// The three-way dedup rule.
pub fn same_message(existing: &Message, incoming: &Message, window_ms: i64) -> bool {
    existing.body == incoming.body
        && existing.sender.user_id.is_some()
        && existing.sender.user_id == incoming.sender.user_id
        && within(existing.received_at_ms, incoming.received_at_ms, window_ms)
}

/// `|a - b| < window` without overflow; timestamps come off the wire.
fn within(a: i64, b: i64, window_ms: i64) -> bool {
    a.abs_diff(b) < window_ms.unsigned_abs()
}

impl MessageStore {
    pub fn new(dedup_window_ms: i64) -> Self {
        Self {
            dedup_window_ms,
            timelines: HashMap::new(),
            loading: HashSet::new(),
            loaded: HashSet::new(),
        }
    }

    pub fn dedup_window_ms(&self) -> i64 {
        self.dedup_window_ms
    }

    /// Snapshot of a channel's timeline, if one exists.
    pub fn timeline(&self, channel_id: &ChannelId) -> Option<Timeline> {
        self.timelines.get(channel_id).cloned()
    }

    /// Snapshot of a channel's timeline, empty when absent.
    pub fn messages(&self, channel_id: &ChannelId) -> Timeline {
        self.timeline(channel_id).unwrap_or_default()
    }

    pub fn has_timeline(&self, channel_id: &ChannelId) -> bool {
        self.timelines.contains_key(channel_id)
    }

    pub fn is_loading(&self, channel_id: &ChannelId) -> bool {
        self.loading.contains(channel_id)
    }

    pub fn is_loaded(&self, channel_id: &ChannelId) -> bool {
        self.loaded.contains(channel_id)
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.timelines.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Append a locally originated message before the server has seen it.
    /// Returns its index.
    pub fn record_optimistic(&mut self, mut message: Message) -> usize {
        message.provenance = Provenance::Optimistic;
        let timeline = self.timelines.entry(message.channel_id.clone()).or_default();
        let entries = Arc::make_mut(timeline);
        entries.push(message);
        entries.len() - 1
    }

    /// Merge a server-pushed message into its channel timeline.
    pub fn record_pushed(&mut self, mut message: Message) -> PushOutcome {
        message.provenance = Provenance::Confirmed;
        let window = self.dedup_window_ms;
        let timeline = self.timelines.entry(message.channel_id.clone()).or_default();

        if let Some(index) = timeline
            .iter()
            .position(|m| m.is_optimistic() && same_message(m, &message, window))
        {
            let entries = Arc::make_mut(timeline);
            let replaced = std::mem::replace(&mut entries[index], message);
            return PushOutcome::Confirmed {
                index,
                replaced: replaced.id,
            };
        }

        if let Some(index) = timeline
            .iter()
            .position(|m| !m.is_optimistic() && same_message(m, &message, window))
        {
            return PushOutcome::Duplicate { index };
        }

        let entries = Arc::make_mut(timeline);
        entries.push(message);
        PushOutcome::Appended {
            index: entries.len() - 1,
        }
    }

    /// Claim the history load for a channel. Only `Started` obliges the
    /// caller to fetch and later call [`finish_load`](Self::finish_load).
    pub fn begin_load(&mut self, channel_id: &ChannelId) -> BeginLoad {
        if self.loaded.contains(channel_id) {
            BeginLoad::AlreadyLoaded
        } else if !self.loading.insert(channel_id.clone()) {
            BeginLoad::InFlight
        } else {
            BeginLoad::Started
        }
    }

    /// Complete a load started with [`begin_load`](Self::begin_load).
    ///
    /// `history` must already be oldest-first. Entries recorded while the
    /// fetch was in flight are kept after the history unless a confirmed one
    /// is already present in it. `None` marks a failed fetch and leaves the
    /// channel retryable.
    ///
    /// Returns `false` when no load was in flight (stale result after a
    /// [`clear`](Self::clear)); nothing changes in that case.
    pub fn finish_load(&mut self, channel_id: &ChannelId, history: Option<Vec<Message>>) -> bool {
        if !self.loading.remove(channel_id) {
            return false;
        }
        let Some(mut merged) = history else {
            return true;
        };

        let window = self.dedup_window_ms;
        if let Some(live) = self.timelines.get(channel_id) {
            for entry in live.iter() {
                let in_history = !entry.is_optimistic()
                    && merged.iter().any(|h| {
                        h.body == entry.body
                            && h.sender.display_name == entry.sender.display_name
                            && within(h.created_at_ms, entry.created_at_ms, window)
                    });
                if !in_history {
                    merged.push(entry.clone());
                }
            }
        }

        self.timelines.insert(channel_id.clone(), Arc::new(merged));
        self.loaded.insert(channel_id.clone());
        true
    }

    /// Drop every timeline and load marker (active server changed).
    pub fn clear(&mut self) {
        self.timelines.clear();
        self.loading.clear();
        self.loaded.clear();
    }
}
