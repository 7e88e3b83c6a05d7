//! Bounded window of recently received message ids.
//!
//! Every incoming message id is registered here together with its
//! ack-required bit. A second registration of the same id is refused, and so
//! is any id at or below the window minimum once the window is full: such an
//! id is presumed to be a stale duplicate whose original already fell out of
//! the window.
//!
//! Eviction is by id order rather than recency. The peer allocates ids in
//! increasing order, so the smallest ids are also the oldest.

use courier_wire::{msg_state, MessageId};
use std::collections::BTreeMap;

/// Result of looking an id up in the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLookup {
    /// Id is not tracked
    NotFound,
    /// Id is tracked and its message must be acknowledged
    NeedsAck,
    /// Id is tracked and needs no acknowledgement
    NoAckNeeded,
}

/// Bounded tracker of incoming message ids
#[derive(Debug, Clone)]
pub struct IdWindow {
    ids: BTreeMap<MessageId, bool>,
    capacity: usize,
}

impl IdWindow {
    /// Create an empty window
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: BTreeMap::new(),
            capacity,
        }
    }

    /// Record `id`, returning false if it was already seen or is stale
    pub fn register(&mut self, id: MessageId, needs_ack: bool) -> bool {
        if self.ids.contains_key(&id) {
            return false;
        }
        if self.ids.len() >= self.capacity && id <= self.minimum() {
            return false;
        }
        self.ids.insert(id, needs_ack);
        true
    }

    /// Smallest tracked id, `MessageId(0)` when empty
    pub fn minimum(&self) -> MessageId {
        self.ids.keys().next().copied().unwrap_or_default()
    }

    /// Largest tracked id, `MessageId(0)` when empty
    pub fn maximum(&self) -> MessageId {
        self.ids.keys().next_back().copied().unwrap_or_default()
    }

    /// Evict the smallest ids until at most `target` remain
    pub fn shrink(&mut self, target: usize) {
        while self.ids.len() > target {
            self.ids.pop_first();
        }
    }

    /// Evict down to the configured capacity
    pub fn shrink_to_capacity(&mut self) {
        self.shrink(self.capacity);
    }

    /// Look up the stored ack state of `id`
    pub fn lookup(&self, id: MessageId) -> AckLookup {
        match self.ids.get(&id) {
            None => AckLookup::NotFound,
            Some(true) => AckLookup::NeedsAck,
            Some(false) => AckLookup::NoAckNeeded,
        }
    }

    /// Delivery state byte reported back to a peer asking about `id`
    pub fn state_of(&self, id: MessageId) -> u8 {
        match self.lookup(id) {
            AckLookup::NeedsAck => msg_state::RECEIVED,
            AckLookup::NoAckNeeded => msg_state::RECEIVED | msg_state::NO_ACK_NEEDED,
            AckLookup::NotFound if self.ids.is_empty() => msg_state::UNKNOWN,
            AckLookup::NotFound if id < self.minimum() => msg_state::NOT_RECEIVED_TOO_LOW,
            AckLookup::NotFound if id > self.maximum() => msg_state::NOT_RECEIVED_TOO_HIGH,
            AckLookup::NotFound => msg_state::UNKNOWN,
        }
    }

    /// Forget every id
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tracked ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.ids.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_keeps_original_ack_state() {
        let mut window = IdWindow::new(400);

        assert!(window.register(MessageId(100), true));
        assert_eq!(window.lookup(MessageId(100)), AckLookup::NeedsAck);

        assert!(!window.register(MessageId(100), false));
        assert_eq!(window.lookup(MessageId(100)), AckLookup::NeedsAck);
        assert_eq!(window.lookup(MessageId(101)), AckLookup::NotFound);
    }

    #[test]
    fn test_shrink_keeps_largest_ids() {
        let mut window = IdWindow::new(3);
        for id in 1..=4 {
            assert!(window.register(MessageId(id), false));
        }
        assert_eq!(window.len(), 4);

        window.shrink(3);
        let kept: Vec<_> = window.ids().collect();
        assert_eq!(kept, vec![MessageId(2), MessageId(3), MessageId(4)]);

        assert!(!window.register(MessageId(1), true));
        assert_eq!(window.lookup(MessageId(1)), AckLookup::NotFound);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_full_window_rejects_ids_at_minimum() {
        let mut window = IdWindow::new(2);
        window.register(MessageId(10), false);
        window.register(MessageId(20), false);

        assert!(!window.register(MessageId(10), true));
        assert!(!window.register(MessageId(5), true));
        assert!(window.register(MessageId(15), true));
        assert_eq!(window.minimum(), MessageId(10));
        assert_eq!(window.maximum(), MessageId(20));
    }

    #[test]
    fn test_below_capacity_accepts_old_ids() {
        let mut window = IdWindow::new(10);
        window.register(MessageId(50), false);
        assert!(window.register(MessageId(7), false));
        assert_eq!(window.minimum(), MessageId(7));
    }

    #[test]
    fn test_empty_window_sentinels() {
        let mut window = IdWindow::new(4);
        assert_eq!(window.minimum(), MessageId(0));
        assert_eq!(window.maximum(), MessageId(0));

        window.register(MessageId(3), true);
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.lookup(MessageId(3)), AckLookup::NotFound);
    }

    #[test]
    fn test_state_bytes() {
        let mut window = IdWindow::new(10);
        assert_eq!(window.state_of(MessageId(8)), msg_state::UNKNOWN);

        window.register(MessageId(8), true);
        window.register(MessageId(16), false);

        assert_eq!(window.state_of(MessageId(8)), msg_state::RECEIVED);
        assert_eq!(
            window.state_of(MessageId(16)),
            msg_state::RECEIVED | msg_state::NO_ACK_NEEDED
        );
        assert_eq!(window.state_of(MessageId(4)), msg_state::NOT_RECEIVED_TOO_LOW);
        assert_eq!(window.state_of(MessageId(32)), msg_state::NOT_RECEIVED_TOO_HIGH);
        assert_eq!(window.state_of(MessageId(12)), msg_state::UNKNOWN);
    }
}
