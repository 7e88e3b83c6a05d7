//! Requests and their bookkeeping metadata.

use bitflags::bitflags;
use bytes::Bytes;
use courier_wire::{MessageId, SeqNo};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::PeerError;

/// Client-local request identifier, stable across resends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-request routing and negotiation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u8 {
        /// Request depends on the protocol layer being initialised
        const NEEDS_LAYER = 0x01;
        /// Request must go to the primary datacenter
        const TO_PRIMARY_DC = 0x02;
    }
}

/// What a queued message is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Caller request awaiting a result
    Rpc,
    /// Liveness probe
    Ping {
        /// Probe identifier
        ping_id: u64,
    },
    /// Answer to a peer ping
    Pong,
    /// Acknowledgement of received messages
    Ack,
    /// Query for the delivery state of our messages
    StateRequest {
        /// Queried ids, in the order sent
        ids: Vec<MessageId>,
    },
    /// Answer to a peer state query
    StateInfo,
    /// Sent container
    Container {
        /// Ids of the batched messages
        inner: Vec<MessageId>,
    },
}

impl RequestKind {
    /// Whether messages of this kind are content-related
    pub fn needs_ack(&self) -> bool {
        matches!(
            self,
            RequestKind::Rpc | RequestKind::Ping { .. } | RequestKind::StateRequest { .. }
        )
    }

    /// Whether sent messages of this kind are kept in the sent queue
    pub fn tracked(&self) -> bool {
        !matches!(
            self,
            RequestKind::Ack | RequestKind::Pong | RequestKind::StateInfo
        )
    }
}

/// A message travelling through the session queues
#[derive(Debug, Clone)]
pub struct Request {
    /// Stable identifier
    pub id: RequestId,
    /// Message kind
    pub kind: RequestKind,
    /// Serialized body
    pub body: Bytes,
    /// Routing and negotiation flags
    pub flags: RequestFlags,
    /// Request that must complete before this one goes out
    pub after: Option<RequestId>,
    /// How long to wait for an answer before the sweep acts
    pub max_wait: Duration,
    /// Message id of the latest transmission
    pub msg_id: Option<MessageId>,
    /// Sequence number of the latest transmission
    pub seq_no: SeqNo,
    /// Time of the latest transmission
    pub sent_at: Option<Instant>,
    /// Whether the peer acknowledged the latest transmission
    pub acked: bool,
    /// Number of retransmissions so far
    pub attempts: u32,
    /// Earliest time the next transmission may happen
    pub not_before: Option<Instant>,
}

impl Request {
    /// Create an unsent request
    pub fn new(id: RequestId, kind: RequestKind, body: Bytes, max_wait: Duration) -> Self {
        Self {
            id,
            kind,
            body,
            flags: RequestFlags::empty(),
            after: None,
            max_wait,
            msg_id: None,
            seq_no: SeqNo::default(),
            sent_at: None,
            acked: false,
            attempts: 0,
            not_before: None,
        }
    }

    /// Whether the peer must acknowledge this message
    pub fn needs_ack(&self) -> bool {
        self.kind.needs_ack()
    }

    /// Forget the previous transmission so the next one is stamped afresh
    pub fn clear_stamp(&mut self) -> Option<MessageId> {
        self.seq_no = SeqNo::default();
        self.sent_at = None;
        self.acked = false;
        self.msg_id.take()
    }

    /// Whether the answer deadline has passed at `now`
    pub fn overdue(&self, now: Instant) -> bool {
        self.sent_at
            .and_then(|sent| sent.checked_add(self.max_wait))
            .map_or(false, |due| due < now)
    }
}

/// Anything that can be sent as a request body
pub trait Serializable {
    /// Serialize into a request body
    fn to_bytes(&self) -> Bytes;
}

impl Serializable for Bytes {
    fn to_bytes(&self) -> Bytes {
        self.clone()
    }
}

impl Serializable for Vec<u8> {
    fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl Serializable for [u8] {
    fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

/// Callback fired with a successful result
pub type DoneHandler = Box<dyn FnOnce(RequestId, Bytes) + Send + Sync>;

/// Callback fired with a peer error
pub type FailHandler = Box<dyn FnOnce(RequestId, PeerError) + Send + Sync>;

/// Callback fired for each update pushed by the peer
pub type UpdateHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Result callbacks of one request; each fires at most once
#[derive(Default)]
pub struct ResponseHandler {
    /// Fired on success
    pub on_done: Option<DoneHandler>,
    /// Fired on failure
    pub on_fail: Option<FailHandler>,
}

impl ResponseHandler {
    /// Handler without callbacks
    pub fn none() -> Self {
        Self::default()
    }

    /// Handler with both callbacks
    pub fn new<D, F>(on_done: D, on_fail: F) -> Self
    where
        D: FnOnce(RequestId, Bytes) + Send + Sync + 'static,
        F: FnOnce(RequestId, PeerError) + Send + Sync + 'static,
    {
        Self {
            on_done: Some(Box::new(on_done)),
            on_fail: Some(Box::new(on_fail)),
        }
    }

    /// Fire with a response and consume the handler
    pub fn fire(self, id: RequestId, response: Response) {
        match response {
            Response::Done(result) => {
                if let Some(on_done) = self.on_done {
                    on_done(id, result);
                }
            }
            Response::Failed(error) => {
                if let Some(on_fail) = self.on_fail {
                    on_fail(id, error);
                }
            }
        }
    }
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandler")
            .field("on_done", &self.on_done.is_some())
            .field("on_fail", &self.on_fail.is_some())
            .finish()
    }
}

/// Completed result waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Successful result body
    Done(Bytes),
    /// Peer error
    Failed(PeerError),
}

/// Options for [`enqueue`](crate::SessionController::enqueue)
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// How long the request may wait to be batched with others
    pub can_wait: Duration,
    /// Answer deadline; the configured resend timeout when unset
    pub max_wait: Option<Duration>,
    /// Request depends on the protocol layer being initialised
    pub needs_layer: bool,
    /// Request must go to the primary datacenter
    pub to_primary_dc: bool,
    /// Request that must complete first
    pub after: Option<RequestId>,
}

impl SendOptions {
    /// Request flags implied by the options
    pub fn flags(&self) -> RequestFlags {
        let mut flags = RequestFlags::empty();
        flags.set(RequestFlags::NEEDS_LAYER, self.needs_layer);
        flags.set(RequestFlags::TO_PRIMARY_DC, self.to_primary_dc);
        flags
    }
}

/// Externally visible state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No queue holds the request
    NotFound,
    /// Waiting for its first transmission
    Queued,
    /// Waiting to be retransmitted
    Resending,
    /// Transmitted, not yet acknowledged
    Sent,
    /// Acknowledged by the peer, answer pending
    Acked,
    /// Transmitted and past its answer deadline
    TimedOut,
    /// Answer received, not yet delivered
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_kind_classification() {
        assert!(RequestKind::Rpc.needs_ack());
        assert!(RequestKind::Ping { ping_id: 1 }.needs_ack());
        assert!(!RequestKind::Ack.needs_ack());
        assert!(!RequestKind::Container { inner: vec![] }.needs_ack());

        assert!(RequestKind::Container { inner: vec![] }.tracked());
        assert!(!RequestKind::Pong.tracked());
        assert!(!RequestKind::StateInfo.tracked());
    }

    #[test]
    fn test_clear_stamp() {
        let mut request = Request::new(
            RequestId(1),
            RequestKind::Rpc,
            Bytes::from_static(b"req"),
            Duration::from_secs(10),
        );
        request.msg_id = Some(MessageId(44));
        request.seq_no = SeqNo(3);
        request.acked = true;

        assert_eq!(request.clear_stamp(), Some(MessageId(44)));
        assert_eq!(request.msg_id, None);
        assert_eq!(request.seq_no, SeqNo(0));
        assert!(!request.acked);
    }

    #[test]
    fn test_unbounded_deadline_is_never_overdue() {
        let mut request = Request::new(
            RequestId(2),
            RequestKind::Rpc,
            Bytes::from_static(b"req"),
            Duration::MAX,
        );
        let now = Instant::now();
        request.sent_at = Some(now);
        assert!(!request.overdue(now + Duration::from_secs(3600)));

        request.max_wait = Duration::from_secs(1);
        assert!(request.overdue(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_handler_fires_matching_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::clone(&seen);
        let failed = Arc::clone(&seen);

        let handler = ResponseHandler::new(
            move |id, body| done.lock().unwrap().push(format!("{} done {:?}", id, body)),
            move |id, err| failed.lock().unwrap().push(format!("{} fail {}", id, err)),
        );
        handler.fire(RequestId(7), Response::Failed(PeerError::new(400, "BAD")));

        assert_eq!(*seen.lock().unwrap(), vec!["#7 fail peer error 400: BAD"]);
    }

    #[test]
    fn test_options_flags() {
        let options = SendOptions {
            needs_layer: true,
            ..Default::default()
        };
        assert_eq!(options.flags(), RequestFlags::NEEDS_LAYER);
    }
}
