//! # Request/Response Correlator
//!
//! Turns the fire-and-forget duplex into awaitable history requests keyed by
//! channel id.
//!
//! ## Guarantees
//! - At most one pending request per key. A second `attach` for a key that
//!   is still pending joins it: no second frame goes out and every waiter
//!   receives the same outcome.
//! - Exactly one settlement per registration. Whichever of response, timeout
//!   or reset happens first removes the entry; the others find nothing and
//!   are no-ops.
//!
//! The registry is plain data owned by the session task. Time is passed in,
//! so expiry is deterministic under a paused clock.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Result, SyncError};
use crate::protocol::{ChannelId, Message};

/// What a waiter receives: the chronological timeline, or why there is none.
pub type Outcome = Result<Vec<Message>>;

/// How a correlated request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Resolved,
    Rejected,
    TimedOut,
}

/// Whether `attach` created a new request or joined an outstanding one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The caller must send the request frame.
    Issued,
    /// A request is already on the wire; nothing to send.
    Joined,
}

/// Result of settling one pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub channel_id: ChannelId,
    pub state: RequestState,
    /// Waiters that were still listening.
    pub delivered: usize,
}

#[derive(Debug)]
struct PendingRequest {
    waiters: Vec<oneshot::Sender<Outcome>>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Correlator {
    timeout: Duration,
    pending: HashMap<ChannelId, PendingRequest>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register interest in `channel_id` and get a receiver for the outcome.
    #[cfg(test)]
    pub fn register(
        &mut self,
        channel_id: ChannelId,
        now: Instant,
    ) -> (oneshot::Receiver<Outcome>, Registration) {
        let (tx, rx) = oneshot::channel();
        (rx, self.attach(channel_id, now, Some(tx)))
    }

    /// Register interest with an optional caller-supplied waiter. With
    /// `None` the request is tracked for its deadline only; the owner learns
    /// the outcome from the returned [`Settled`] values.
    pub fn attach(
        &mut self,
        channel_id: ChannelId,
        now: Instant,
        waiter: Option<oneshot::Sender<Outcome>>,
    ) -> Registration {
        match self.pending.get_mut(&channel_id) {
            Some(existing) => {
                existing.waiters.extend(waiter);
                Registration::Joined
            }
            None => {
                self.pending.insert(
                    channel_id,
                    PendingRequest {
                        waiters: waiter.into_iter().collect(),
                        deadline: now + self.timeout,
                    },
                );
                Registration::Issued
            }
        }
    }

    pub fn is_pending(&self, channel_id: &ChannelId) -> bool {
        self.pending.contains_key(channel_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Deliver a response. `None` when nothing is pending for the key
    /// (late, duplicate or unsolicited response).
    pub fn resolve(&mut self, channel_id: &ChannelId, messages: Vec<Message>) -> Option<Settled> {
        let pending = self.pending.remove(channel_id)?;
        Some(settle(channel_id.clone(), pending, RequestState::Resolved, || {
            Ok(messages.clone())
        }))
    }

    /// Fail the request for one key with `error`.
    #[cfg(test)]
    pub fn reject(&mut self, channel_id: &ChannelId, error: SyncError) -> Option<Settled> {
        let pending = self.pending.remove(channel_id)?;
        Some(settle(channel_id.clone(), pending, RequestState::Rejected, || {
            Err(error.clone())
        }))
    }

    /// Reject every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Settled> {
        let expired: Vec<ChannelId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let after_ms = self.timeout.as_millis() as u64;
        expired
            .into_iter()
            .filter_map(|channel_id| {
                let pending = self.pending.remove(&channel_id)?;
                let error = SyncError::Timeout {
                    channel_id: channel_id.clone(),
                    after_ms,
                };
                Some(settle(channel_id, pending, RequestState::TimedOut, || {
                    Err(error.clone())
                }))
            })
            .collect()
    }

    /// Reject everything with `error` and clear the registry.
    pub fn reject_all(&mut self, error: SyncError) -> Vec<Settled> {
        self.pending
            .drain()
            .map(|(channel_id, pending)| {
                settle(channel_id, pending, RequestState::Rejected, || Err(error.clone()))
            })
            .collect()
    }
}

fn settle(
    channel_id: ChannelId,
    pending: PendingRequest,
    state: RequestState,
    outcome: impl Fn() -> Outcome,
) -> Settled {
    let delivered = pending
        .waiters
        .into_iter()
        .filter_map(|tx| tx.send(outcome()).ok())
        .count();
    Settled {
        channel_id,
        state,
        delivered,
    }
}
