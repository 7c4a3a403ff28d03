//! Channel subscription state machine.
//!
//! Tracks the single active channel and yields the control frames each
//! transition requires. It never writes to the socket itself; the session
//! sends whatever it returns, in order.

use crate::protocol::{ChannelId, OutboundFrame};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    Joined(ChannelId),
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    current: Subscription,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ChannelId> {
        match &self.current {
            Subscription::Joined(id) => Some(id),
            Subscription::None => None,
        }
    }

    pub fn state(&self) -> &Subscription {
        &self.current
    }

    /// Move to `target`. Leave for the old channel always precedes join for
    /// the new one. Re-selecting the joined channel yields nothing.
    pub fn select(&mut self, target: Option<ChannelId>) -> Vec<OutboundFrame> {
        let mut frames = Vec::with_capacity(2);
        if self.current() == target.as_ref() {
            return frames;
        }
        if let Subscription::Joined(old) = std::mem::take(&mut self.current) {
            frames.push(OutboundFrame::LeaveChannel { channel_id: old });
        }
        if let Some(channel_id) = target {
            frames.push(OutboundFrame::JoinChannel {
                channel_id: channel_id.clone(),
            });
            self.current = Subscription::Joined(channel_id);
        }
        frames
    }

    /// Join frame to re-assert the subscription on a fresh connection.
    pub fn on_connection_opened(&self) -> Option<OutboundFrame> {
        self.current().map(|channel_id| OutboundFrame::JoinChannel {
            channel_id: channel_id.clone(),
        })
    }

    /// Forget the active channel without emitting anything (normal closure,
    /// user disconnect).
    pub fn clear(&mut self) {
        self.current = Subscription::None;
    }

    /// Chat messages are only accepted for the joined channel.
    pub fn accepts(&self, channel_id: &ChannelId) -> bool {
        self.current() == Some(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(id: &str) -> OutboundFrame {
        OutboundFrame::JoinChannel { channel_id: id.into() }
    }

    fn leave(id: &str) -> OutboundFrame {
        OutboundFrame::LeaveChannel { channel_id: id.into() }
    }

    #[test]
    fn test_first_select_only_joins() {
        let mut m = SubscriptionManager::new();
        assert_eq!(m.select(Some("c1".into())), vec![join("c1")]);
        assert_eq!(m.state(), &Subscription::Joined("c1".into()));
    }

    #[test]
    fn test_switch_leaves_then_joins() {
        let mut m = SubscriptionManager::new();
        m.select(Some("a".into()));
        assert_eq!(m.select(Some("b".into())), vec![leave("a"), join("b")]);
        assert_eq!(m.current(), Some(&ChannelId::from("b")));
    }

    #[test]
    fn test_reselect_is_noop() {
        let mut m = SubscriptionManager::new();
        m.select(Some("a".into()));
        assert!(m.select(Some("a".into())).is_empty());
    }

    #[test]
    fn test_deselect_leaves() {
        let mut m = SubscriptionManager::new();
        m.select(Some("a".into()));
        assert_eq!(m.select(None), vec![leave("a")]);
        assert_eq!(m.state(), &Subscription::None);
        assert!(m.select(None).is_empty());
    }

    #[test]
    fn test_reconnect_reasserts_join() {
        let mut m = SubscriptionManager::new();
        assert_eq!(m.on_connection_opened(), None);
        m.select(Some("c1".into()));
        assert_eq!(m.on_connection_opened(), Some(join("c1")));
    }

    #[test]
    fn test_accepts_only_joined_channel() {
        let mut m = SubscriptionManager::new();
        assert!(!m.accepts(&"c1".into()));
        m.select(Some("c1".into()));
        assert!(m.accepts(&"c1".into()));
        assert!(!m.accepts(&"c2".into()));
        m.clear();
        assert!(!m.accepts(&"c1".into()));
    }
}
