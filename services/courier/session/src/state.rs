//! Shared session state.
//!
//! [`SessionState`] is the only mutable object shared between the network
//! side and the processing side of a session. The identity block and every
//! queue sit behind their own lock so that, for example, ack bookkeeping and
//! payload delivery never wait on each other. Callers hold one queue lock at a
//! time and copy out what they need from it before touching the next queue.
//! The single exception is [`SessionState::stamp`], which takes the identity
//! lock and then the sent-queue lock, always in that order.

use bytes::Bytes;
use courier_wire::{MessageId, MessageIdGenerator, SeqNo};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::id_window::IdWindow;
use crate::request::{Request, RequestId, RequestKind, RequestState, Response};

/// Opaque reference to an authorization key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKey {
    key_id: u64,
    material: Bytes,
}

impl AuthKey {
    /// Wrap key material under its identifier
    pub fn new(key_id: u64, material: Bytes) -> Self {
        Self { key_id, material }
    }

    /// Key identifier
    pub fn key_id(&self) -> u64 {
        self.key_id
    }

    /// Raw key material, handed to the transport for encryption
    pub fn material(&self) -> &Bytes {
        &self.material
    }
}

#[derive(Debug, Default)]
struct Identity {
    session_id: u64,
    salt: u64,
    key: Option<AuthKey>,
    key_checked: bool,
    layer_initialized: bool,
    messages_sent: u32,
}

impl Identity {
    fn next_seq_no(&mut self, needs_ack: bool) -> SeqNo {
        let seq_no = SeqNo::from_counter(self.messages_sent, needs_ack);
        if needs_ack {
            self.messages_sent = self.messages_sent.wrapping_add(1);
        }
        seq_no
    }
}

/// Session identity and message queues
#[derive(Debug)]
pub struct SessionState {
    identity: RwLock<Identity>,
    to_send: RwLock<BTreeMap<RequestId, Request>>,
    have_sent: RwLock<BTreeMap<MessageId, Request>>,
    to_resend: RwLock<BTreeMap<MessageId, RequestId>>,
    were_acked: RwLock<BTreeMap<MessageId, RequestId>>,
    received_responses: RwLock<BTreeMap<RequestId, Response>>,
    received_updates: RwLock<VecDeque<Bytes>>,
    state_request: RwLock<BTreeSet<MessageId>>,
    received_ids: RwLock<IdWindow>,
    to_ack: RwLock<Vec<MessageId>>,
    id_generator: MessageIdGenerator,
    closed: AtomicBool,
}

impl SessionState {
    /// Create an empty state with a random session id
    pub fn new(id_window_capacity: usize) -> Self {
        Self {
            identity: RwLock::new(Identity {
                session_id: rand::random(),
                ..Default::default()
            }),
            to_send: RwLock::new(BTreeMap::new()),
            have_sent: RwLock::new(BTreeMap::new()),
            to_resend: RwLock::new(BTreeMap::new()),
            were_acked: RwLock::new(BTreeMap::new()),
            received_responses: RwLock::new(BTreeMap::new()),
            received_updates: RwLock::new(VecDeque::new()),
            state_request: RwLock::new(BTreeSet::new()),
            received_ids: RwLock::new(IdWindow::new(id_window_capacity)),
            to_ack: RwLock::new(Vec::new()),
            id_generator: MessageIdGenerator::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse every later [`stamp`](Self::stamp); used when the session is killed
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current session id
    pub async fn session_id(&self) -> u64 {
        self.identity.read().await.session_id
    }

    /// Set the session id; a different id restarts sequence numbering
    pub async fn set_session(&self, session_id: u64) {
        let mut identity = self.identity.write().await;
        if identity.session_id != session_id {
            debug!(
                "Session id changed {:#x} -> {:#x}",
                identity.session_id, session_id
            );
            identity.session_id = session_id;
            identity.messages_sent = 0;
        }
    }

    /// Current server salt
    pub async fn salt(&self) -> u64 {
        self.identity.read().await.salt
    }

    /// Replace the server salt
    pub async fn set_salt(&self, salt: u64) {
        self.identity.write().await.salt = salt;
    }

    /// Session id and salt, read together
    pub async fn envelope_identity(&self) -> (u64, u64) {
        let identity = self.identity.read().await;
        (identity.session_id, identity.salt)
    }

    /// Current key reference
    pub async fn key(&self) -> Option<AuthKey> {
        self.identity.read().await.key.clone()
    }

    /// Whether a key is installed
    pub async fn has_key(&self) -> bool {
        self.identity.read().await.key.is_some()
    }

    /// Install a key reference.
    ///
    /// A different key starts a fresh session: new random session id,
    /// sequence numbering from zero and an uninitialised layer. Installing
    /// the same key again changes nothing. Returns whether the key changed.
    pub async fn set_key(&self, key: Option<AuthKey>) -> bool {
        let mut identity = self.identity.write().await;
        if identity.key == key {
            return false;
        }

        let session_id = rand::random();
        info!(
            "Key changed to {:?}, new session {:#x}",
            key.as_ref().map(AuthKey::key_id),
            session_id
        );
        identity.key = key;
        identity.key_checked = false;
        identity.session_id = session_id;
        identity.messages_sent = 0;
        identity.layer_initialized = false;
        true
    }

    /// Whether the peer has accepted a message under the current key
    pub async fn key_checked(&self) -> bool {
        self.identity.read().await.key_checked
    }

    /// Mark the current key as accepted (or not) by the peer; ignored without a key
    pub async fn set_key_checked(&self, checked: bool) {
        let mut identity = self.identity.write().await;
        if identity.key.is_some() {
            identity.key_checked = checked;
        }
    }

    /// Whether the protocol layer is initialised for this session
    pub async fn layer_initialized(&self) -> bool {
        self.identity.read().await.layer_initialized
    }

    /// Mark the protocol layer (un)initialised
    pub async fn set_layer_initialized(&self, initialized: bool) {
        self.identity.write().await.layer_initialized = initialized;
    }

    /// Content-related messages sent in this session
    pub async fn messages_sent(&self) -> u32 {
        self.identity.read().await.messages_sent
    }

    /// Next sequence number; the counter advances only for ack-needing messages
    pub async fn next_seq_no(&self, needs_ack: bool) -> SeqNo {
        self.identity.write().await.next_seq_no(needs_ack)
    }

    /// Message id generator of this session
    pub fn id_generator(&self) -> &MessageIdGenerator {
        &self.id_generator
    }

    /// Assign a fresh message id and sequence number to `request`.
    ///
    /// Tracked kinds are recorded in the sent queue before the identity lock
    /// is released, so concurrent stamps can never hand out sequence numbers
    /// out of order with respect to the sent queue. Returns `None` once the
    /// state is closed.
    pub async fn stamp(&self, mut request: Request) -> Option<(MessageId, Request)> {
        let mut identity = self.identity.write().await;
        if self.is_closed() {
            return None;
        }
        let msg_id = self.id_generator.next();
        request.msg_id = Some(msg_id);
        request.seq_no = identity.next_seq_no(request.needs_ack());
        request.sent_at = Some(Instant::now());

        if request.kind.tracked() {
            let mut have_sent = self.have_sent.write().await;
            have_sent.insert(msg_id, request.clone());
        }
        Some((msg_id, request))
    }

    /// Requests not yet transmitted
    pub fn to_send(&self) -> &RwLock<BTreeMap<RequestId, Request>> {
        &self.to_send
    }

    /// Transmitted messages awaiting an answer or an ack
    pub fn have_sent(&self) -> &RwLock<BTreeMap<MessageId, Request>> {
        &self.have_sent
    }

    /// Old message ids of requests queued for retransmission
    pub fn to_resend(&self) -> &RwLock<BTreeMap<MessageId, RequestId>> {
        &self.to_resend
    }

    /// Message ids already acknowledged by the peer
    pub fn were_acked(&self) -> &RwLock<BTreeMap<MessageId, RequestId>> {
        &self.were_acked
    }

    /// Completed results awaiting delivery
    pub fn received_responses(&self) -> &RwLock<BTreeMap<RequestId, Response>> {
        &self.received_responses
    }

    /// Peer pushes awaiting delivery, in arrival order
    pub fn received_updates(&self) -> &RwLock<VecDeque<Bytes>> {
        &self.received_updates
    }

    /// Message ids whose delivery state should be queried
    pub fn state_request(&self) -> &RwLock<BTreeSet<MessageId>> {
        &self.state_request
    }

    /// Window of incoming message ids
    pub fn received_ids(&self) -> &RwLock<IdWindow> {
        &self.received_ids
    }

    /// Incoming message ids awaiting our acknowledgement
    pub fn to_ack(&self) -> &RwLock<Vec<MessageId>> {
        &self.to_ack
    }

    /// Snapshot of the state of `id`, probing one queue at a time
    pub async fn request_state(&self, id: RequestId) -> RequestState {
        if self.received_responses.read().await.contains_key(&id) {
            return RequestState::Completed;
        }

        if self.to_send.read().await.contains_key(&id) {
            let resending = self.to_resend.read().await.values().any(|queued| *queued == id);
            return if resending {
                RequestState::Resending
            } else {
                RequestState::Queued
            };
        }

        let now = Instant::now();
        let have_sent = self.have_sent.read().await;
        match have_sent.values().find(|request| request.id == id) {
            Some(request) if request.acked => RequestState::Acked,
            Some(request) if request.overdue(now) => RequestState::TimedOut,
            Some(_) => RequestState::Sent,
            None => RequestState::NotFound,
        }
    }

    /// Clear every bookkeeping queue and the sequence counter.
    ///
    /// Outstanding caller requests (queued or transmitted) are returned with
    /// their stamps cleared so the caller can queue them again or drop them.
    /// Completed responses and updates stay queued for delivery.
    pub async fn reset_all(&self) -> Vec<Request> {
        let mut outstanding: Vec<Request> = std::mem::take(&mut *self.to_send.write().await)
            .into_values()
            .filter(|request| request.kind == RequestKind::Rpc)
            .collect();

        let sent = std::mem::take(&mut *self.have_sent.write().await);
        outstanding.extend(
            sent.into_values()
                .filter(|request| request.kind == RequestKind::Rpc),
        );
        outstanding.sort_by_key(|request| request.id);
        outstanding.dedup_by_key(|request| request.id);
        for request in &mut outstanding {
            request.clear_stamp();
        }

        self.to_resend.write().await.clear();
        self.were_acked.write().await.clear();
        self.state_request.write().await.clear();
        self.received_ids.write().await.clear();
        self.to_ack.write().await.clear();

        {
            let mut identity = self.identity.write().await;
            identity.messages_sent = 0;
            identity.layer_initialized = false;
        }

        debug!("Session state reset, {} requests outstanding", outstanding.len());
        outstanding
    }

    /// Drop completed responses and updates that were never delivered
    pub async fn clear_delivery(&self) {
        self.received_responses.write().await.clear();
        self.received_updates.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rpc(id: u64) -> Request {
        Request::new(
            RequestId(id),
            RequestKind::Rpc,
            Bytes::from_static(b"rpc"),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_seq_numbers_for_ack_needing_messages() {
        let state = SessionState::new(400);
        for expected in [1u32, 3, 5, 7] {
            assert_eq!(state.next_seq_no(true).await, SeqNo(expected));
        }
        assert_eq!(state.messages_sent().await, 4);

        assert_eq!(state.next_seq_no(false).await, SeqNo(8));
        assert_eq!(state.next_seq_no(false).await, SeqNo(8));
        assert_eq!(state.messages_sent().await, 4);
    }

    #[tokio::test]
    async fn test_first_send_then_service_message() {
        let state = SessionState::new(400);
        assert_eq!(state.next_seq_no(true).await, SeqNo(1));
        assert_eq!(state.next_seq_no(false).await, SeqNo(2));
        assert_eq!(state.messages_sent().await, 1);
    }

    #[tokio::test]
    async fn test_set_key_rotates_session() {
        let state = SessionState::new(400);
        let k1 = AuthKey::new(1, Bytes::from_static(b"one"));
        let k2 = AuthKey::new(2, Bytes::from_static(b"two"));

        assert!(state.set_key(Some(k1.clone())).await);
        state.set_layer_initialized(true).await;
        state.next_seq_no(true).await;
        let first_session = state.session_id().await;

        assert!(!state.set_key(Some(k1)).await);
        assert_eq!(state.session_id().await, first_session);
        assert!(state.layer_initialized().await);
        assert_eq!(state.messages_sent().await, 1);

        assert!(state.set_key(Some(k2)).await);
        assert_ne!(state.session_id().await, first_session);
        assert!(!state.layer_initialized().await);
        assert_eq!(state.messages_sent().await, 0);
    }

    #[tokio::test]
    async fn test_key_checked_follows_key() {
        let state = SessionState::new(400);
        state.set_key_checked(true).await;
        assert!(!state.key_checked().await);

        state
            .set_key(Some(AuthKey::new(1, Bytes::from_static(b"one"))))
            .await;
        state.set_key_checked(true).await;
        assert!(state.key_checked().await);

        state
            .set_key(Some(AuthKey::new(2, Bytes::from_static(b"two"))))
            .await;
        assert!(!state.key_checked().await);
    }

    #[tokio::test]
    async fn test_closed_state_refuses_stamps() {
        let state = SessionState::new(400);
        state.close();
        assert!(state.is_closed());

        assert!(state.stamp(rpc(1)).await.is_none());
        assert!(state.have_sent().read().await.is_empty());
        assert_eq!(state.messages_sent().await, 0);
    }

    #[tokio::test]
    async fn test_set_session_resets_counter_only_on_change() {
        let state = SessionState::new(400);
        state.set_session(77).await;
        state.next_seq_no(true).await;
        state.next_seq_no(true).await;

        state.set_session(77).await;
        assert_eq!(state.messages_sent().await, 2);

        state.set_session(78).await;
        assert_eq!(state.messages_sent().await, 0);
        assert_eq!(state.session_id().await, 78);
    }

    #[tokio::test]
    async fn test_stamp_tracks_only_tracked_kinds() {
        let state = SessionState::new(400);

        let (msg_id, sent) = state.stamp(rpc(1)).await.unwrap();
        assert_eq!(sent.msg_id, Some(msg_id));
        assert_eq!(sent.seq_no, SeqNo(1));
        assert!(state.have_sent().read().await.contains_key(&msg_id));

        let ack = Request::new(
            RequestId(2),
            RequestKind::Ack,
            Bytes::new(),
            Duration::from_secs(10),
        );
        let (ack_id, ack) = state.stamp(ack).await.unwrap();
        assert_eq!(ack.seq_no, SeqNo(2));
        assert!(ack_id > msg_id);
        assert_eq!(state.have_sent().read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_request_state_probes() {
        let state = SessionState::new(400);
        state.to_send().write().await.insert(RequestId(1), rpc(1));
        assert_eq!(state.request_state(RequestId(1)).await, RequestState::Queued);

        state
            .to_resend()
            .write()
            .await
            .insert(MessageId(4), RequestId(1));
        assert_eq!(state.request_state(RequestId(1)).await, RequestState::Resending);

        let request = state.to_send().write().await.remove(&RequestId(1)).unwrap();
        let (msg_id, _) = state.stamp(request).await.unwrap();
        assert_eq!(state.request_state(RequestId(1)).await, RequestState::Sent);

        state
            .have_sent()
            .write()
            .await
            .get_mut(&msg_id)
            .unwrap()
            .acked = true;
        assert_eq!(state.request_state(RequestId(1)).await, RequestState::Acked);
        assert_eq!(state.request_state(RequestId(9)).await, RequestState::NotFound);
    }

    #[tokio::test]
    async fn test_reset_all_returns_outstanding_requests() {
        let state = SessionState::new(400);
        state.to_send().write().await.insert(RequestId(2), rpc(2));
        state.stamp(rpc(1)).await.unwrap();
        state.to_ack().write().await.push(MessageId(12));
        state.received_ids().write().await.register(MessageId(12), true);
        state.set_layer_initialized(true).await;
        state
            .received_responses()
            .write()
            .await
            .insert(RequestId(3), Response::Done(Bytes::new()));

        let outstanding = state.reset_all().await;
        let ids: Vec<_> = outstanding.iter().map(|request| request.id).collect();
        assert_eq!(ids, vec![RequestId(1), RequestId(2)]);
        assert!(outstanding.iter().all(|request| request.msg_id.is_none()));

        assert!(state.to_send().read().await.is_empty());
        assert!(state.have_sent().read().await.is_empty());
        assert!(state.to_ack().read().await.is_empty());
        assert!(state.received_ids().read().await.is_empty());
        assert_eq!(state.messages_sent().await, 0);
        assert!(!state.layer_initialized().await);
        assert_eq!(state.received_responses().read().await.len(), 1);
    }
}
