//! Keepalive bookkeeping with PING/PONG and RTT measurement.
//!
//! Outstanding pings are keyed by ping id and remember when they were sent,
//! so a pong yields a round-trip sample and the sweep can spot a ping the
//! peer never answered.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Outstanding ping tracker
#[derive(Debug)]
pub struct KeepaliveState {
    /// Outstanding ping ids and their send times
    outstanding: DashMap<u64, Instant>,
    /// Next ping id to hand out
    next_ping_id: AtomicU64,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepaliveState {
    /// Create a tracker with a random ping id base
    pub fn new() -> Self {
        Self {
            outstanding: DashMap::new(),
            next_ping_id: AtomicU64::new(rand::random::<u32>() as u64),
        }
    }

    /// Allocate a ping id and record it as sent now
    pub fn record_ping(&self) -> u64 {
        let ping_id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding.insert(ping_id, Instant::now());
        ping_id
    }

    /// Process a PONG and return RTT if the ping id was found
    pub fn process_pong(&self, ping_id: u64) -> Option<Duration> {
        self.outstanding
            .remove(&ping_id)
            .map(|(_, sent_at)| sent_at.elapsed())
    }

    /// Age of the oldest ping unanswered for longer than `timeout`
    pub fn overdue(&self, timeout: Duration) -> Option<Duration> {
        self.outstanding
            .iter()
            .map(|entry| entry.value().elapsed())
            .filter(|age| *age > timeout)
            .max()
    }

    /// Whether any ping is awaiting its pong
    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Forget every outstanding ping
    pub fn clear(&self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_state() {
        let state = KeepaliveState::new();

        let ping_id = state.record_ping();
        assert!(state.has_outstanding());

        let rtt = state.process_pong(ping_id);
        assert!(rtt.is_some());

        // Processing the same pong again should return None
        assert!(state.process_pong(ping_id).is_none());
        assert!(!state.has_outstanding());
    }

    #[test]
    fn test_ping_ids_are_distinct() {
        let state = KeepaliveState::new();
        let first = state.record_ping();
        let second = state.record_ping();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_ping() {
        let state = KeepaliveState::new();
        state.record_ping();

        assert!(state.overdue(Duration::from_secs(75)).is_none());

        tokio::time::advance(Duration::from_secs(76)).await;
        let age = state.overdue(Duration::from_secs(75)).unwrap();
        assert!(age >= Duration::from_secs(76));

        state.clear();
        assert!(state.overdue(Duration::from_secs(75)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_measurement() {
        let state = KeepaliveState::new();
        let ping_id = state.record_ping();

        tokio::time::advance(Duration::from_millis(40)).await;
        let rtt = state.process_pong(ping_id).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
    }
}
