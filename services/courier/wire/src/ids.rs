//! Message identifiers and sequence numbers.
//!
//! A [`MessageId`] is derived from unix time (`seconds << 32 | fraction`) so the
//! peer can reject ids that are wildly out of sync with its clock. Client ids
//! keep the two low bits clear. The generator never hands out the same id twice
//! and never goes backwards, even when the wall clock stalls or steps back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 64-bit message identifier, monotonically increasing within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Unix seconds encoded in the high half of the id
    pub fn unix_secs(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit sequence number; the low bit means "peer must acknowledge"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SeqNo(pub u32);

impl SeqNo {
    /// Build a sequence number from the session's sent-message counter
    pub fn from_counter(counter: u32, needs_ack: bool) -> Self {
        Self(counter.wrapping_mul(2) | u32::from(needs_ack))
    }

    /// Whether the message carrying this sequence number must be acknowledged
    pub fn needs_ack(self) -> bool {
        self.0 & 0x01 != 0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generator of strictly increasing, time-derived message ids
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    /// Last id handed out
    last: AtomicU64,
    /// Correction applied to local unix seconds (peer clock minus local clock)
    time_offset: AtomicI64,
}

impl MessageIdGenerator {
    /// Create a generator with no clock correction
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next message id
    pub fn next(&self) -> MessageId {
        let candidate = self.time_based();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(candidate.max(last.wrapping_add(4)))
            })
            .unwrap_or_else(|last| last);
        MessageId(candidate.max(previous.wrapping_add(4)))
    }

    /// Adopt the peer's clock, using the time encoded in one of its message ids
    pub fn sync_with(&self, peer_msg_id: MessageId) {
        let local = Self::unix_now().0 as i64;
        let offset = i64::from(peer_msg_id.unix_secs()) - local;
        self.time_offset.store(offset, Ordering::Release);
        tracing::debug!("Message id clock offset adjusted to {}s", offset);
    }

    /// Current clock correction in seconds
    pub fn time_offset(&self) -> i64 {
        self.time_offset.load(Ordering::Acquire)
    }

    fn time_based(&self) -> u64 {
        let (secs, nanos) = Self::unix_now();
        let secs = (secs as i64).saturating_add(self.time_offset()).max(0) as u64;
        let fraction = (u64::from(nanos) << 32) / 1_000_000_000;
        ((secs << 32) | fraction) & !0x03
    }

    fn unix_now() -> (u64, u32) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now.as_secs(), now.subsec_nanos())
    }
}
