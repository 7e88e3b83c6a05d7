//! Session tunables.

use courier_wire::MAX_CONTAINER_MESSAGES;
use std::time::Duration;

/// Configuration for a session controller
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Number of incoming message ids kept for duplicate detection
    pub id_window_capacity: usize,
    /// How long a sent request may go unanswered before the sweep acts on it
    pub resend_timeout: Duration,
    /// Extra wait granted to a request the peer reports as received
    pub resend_waiting: Duration,
    /// How long sent containers and state queries are kept
    pub container_lifetime: Duration,
    /// Overdue requests smaller than this are resent, larger ones are state-queried
    pub resend_threshold: usize,
    /// Interval of the periodic sweep
    pub sweep_interval: Duration,
    /// Interval between liveness pings
    pub ping_interval: Duration,
    /// Unanswered ping age that triggers a restart request
    pub ping_timeout: Duration,
    /// How long pending acknowledgements may wait for a ride
    pub ack_wait: Duration,
    /// Batching delay applied to resends
    pub resend_delay: Duration,
    /// Upper bound of messages packed into one container
    pub max_container_messages: usize,
    /// Capacity of the session event channel
    pub event_capacity: usize,
    /// Protocol layer announced with the first layer-dependent request
    pub layer: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id_window_capacity: 400,
            resend_timeout: Duration::from_secs(10),
            resend_waiting: Duration::from_secs(15),
            container_lifetime: Duration::from_secs(600),
            resend_threshold: 1024,
            sweep_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(75),
            ack_wait: Duration::from_secs(1),
            resend_delay: Duration::from_millis(10),
            max_container_messages: MAX_CONTAINER_MESSAGES,
            event_capacity: 64,
            layer: 1,
        }
    }
}
