//! Session controller: request lifecycle and session orchestration.
//!
//! The controller owns a [`SessionState`] and drives every request through
//! it: enqueue into the send queue, stamp and transmit, resend on timeout or
//! reconnect, complete on a result and hand the result to the processing side
//! through [`SessionController::try_to_receive`].
//!
//! Timer work (the periodic sweep, liveness pings and delayed sends) runs on
//! one driver task per controller. The driver holds only a weak reference, so
//! dropping the last [`Arc`] to the controller ends it.
//!
//! [`SessionController::kill`] is terminal. The lifecycle marker it sets is
//! checked at the top of every public operation and again under each queue
//! lock before a write, so nothing is queued and no callback fires after it,
//! not even from an operation that was already running.

use bytes::Bytes;
use courier_wire::{
    Body, Envelope, InnerMessage, MessageId, SeqNo, WireError, CONTAINER_HEADER_SIZE,
    INNER_HEADER_SIZE, LAYER_WRAPPER_SIZE, MAX_BODY_SIZE,
};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{PeerError, SessionError, TransportError};
use crate::keepalive::KeepaliveState;
use crate::policy::{DeliverToCaller, ErrorAction, ErrorPolicy};
use crate::request::{
    Request, RequestFlags, RequestId, RequestKind, RequestState, Response, ResponseHandler,
    SendOptions, Serializable, UpdateHandler,
};
use crate::state::{AuthKey, SessionState};
use crate::transport::{OutboundFrame, Transport};

/// Largest number of ids carried by one `msgs_ack`
const MAX_IDS_PER_ACK: usize = 8192;

/// Acks taken into one send pass; the rest wait for the next pass
const MAX_ACKS_PER_PASS: usize = MAX_IDS_PER_ACK * 4;

/// Largest request body accepted by [`SessionController::enqueue`].
///
/// Leaves room for the layer wrapper and a container around the request.
pub const MAX_REQUEST_SIZE: usize =
    MAX_BODY_SIZE - CONTAINER_HEADER_SIZE - INNER_HEADER_SIZE - LAYER_WRAPPER_SIZE;

/// Longest timer period the driver uses
const MAX_TIMER_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Not running; queues are kept
    Stopped = 0,
    /// Connecting or waiting for a key
    Starting = 1,
    /// Sending and receiving
    Active = 2,
    /// Transport torn down, reconnect pending
    Restarting = 3,
    /// Terminal; the session is inert
    Killed = 4,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Stopped,
            1 => Lifecycle::Starting,
            2 => Lifecycle::Active,
            3 => Lifecycle::Restarting,
            _ => Lifecycle::Killed,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Stopped => "stopped",
            Lifecycle::Starting => "starting",
            Lifecycle::Active => "active",
            Lifecycle::Restarting => "restarting",
            Lifecycle::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Connection state as seen by callers probing session health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connection
    Inactive = 0,
    /// Connection being opened
    Connecting = 1,
    /// Connection ready
    Active = 2,
    /// Connection being re-established
    Restarting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Active,
            3 => ConnectionState::Restarting,
            _ => ConnectionState::Inactive,
        }
    }
}

/// Notifications for the owner of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport failed or the peer stopped answering pings
    NeedsRestart,
    /// A key is required before anything can be sent
    KeyNeeded,
    /// Results or updates are waiting in [`SessionController::try_to_receive`]
    ReceivedReady,
    /// A ping was answered
    Pong {
        /// Round-trip time
        rtt: Duration,
    },
    /// The peer invalidated the session and a new one was started
    SessionReset {
        /// Outstanding requests queued again under the new session
        requeued: usize,
    },
    /// The protocol layer is initialised
    LayerInitialized,
}

/// Message picked for the next transmission together with its wire body
pub(crate) struct Outgoing {
    pub(crate) request: Request,
    pub(crate) wire: Bytes,
}

#[derive(Debug, Clone, Copy)]
enum DriverTick {
    Sweep,
    Ping,
    Wake,
    Send,
}

/// Orchestrates the request lifecycle of one session
pub struct SessionController {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policy: Arc<dyn ErrorPolicy>,
    pub(crate) handlers: DashMap<RequestId, ResponseHandler>,
    pub(crate) update_handler: RwLock<Option<UpdateHandler>>,
    pub(crate) keepalive: KeepaliveState,
    events: mpsc::Sender<SessionEvent>,
    lifecycle: AtomicU8,
    connection: AtomicU8,
    reconnecting: AtomicBool,
    force_batch: AtomicBool,
    next_request_id: AtomicU64,
    /// Request currently carrying the layer declaration, 0 when none
    pub(crate) layer_request: AtomicU64,
    send_deadline: Mutex<Option<Instant>>,
    wake: Arc<Notify>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Create a controller that delivers every peer error to the caller
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        Self::with_policy(config, transport, Arc::new(DeliverToCaller))
    }

    /// Create a controller with a custom error policy
    pub fn with_policy(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn ErrorPolicy>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let controller = Arc::new(Self {
            state: SessionState::new(config.id_window_capacity),
            config,
            transport,
            policy,
            handlers: DashMap::new(),
            update_handler: RwLock::new(None),
            keepalive: KeepaliveState::new(),
            events,
            lifecycle: AtomicU8::new(Lifecycle::Stopped as u8),
            connection: AtomicU8::new(ConnectionState::Inactive as u8),
            reconnecting: AtomicBool::new(false),
            force_batch: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            layer_request: AtomicU64::new(0),
            send_deadline: Mutex::new(None),
            wake: Arc::new(Notify::new()),
            driver: Mutex::new(None),
        });
        (controller, events_rx)
    }

    /// Shared state, for inspection
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Configuration in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Outstanding ping tracker
    pub fn keepalive(&self) -> &KeepaliveState {
        &self.keepalive
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Current connection state
    pub fn session_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection.load(Ordering::Acquire))
    }

    /// Whether [`kill`](Self::kill) was called
    pub fn is_killed(&self) -> bool {
        self.lifecycle() == Lifecycle::Killed
    }

    /// Snapshot of a request's progress
    pub async fn request_state(&self, request_id: RequestId) -> Result<RequestState, SessionError> {
        self.ensure_alive()?;
        Ok(self.state.request_state(request_id).await)
    }

    /// Register the handler receiving peer updates
    pub async fn set_update_handler<F>(&self, handler: F) -> Result<(), SessionError>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        *self.update_handler.write().await = Some(Box::new(handler));
        Ok(())
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.is_killed() {
            return Err(SessionError::Killed);
        }
        Ok(())
    }

    /// Move to `to` unless the session was killed
    fn set_lifecycle(&self, to: Lifecycle) -> bool {
        self.lifecycle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != Lifecycle::Killed as u8).then_some(to as u8)
            })
            .is_ok()
    }

    fn set_connection(&self, to: ConnectionState) {
        self.connection.store(to as u8, Ordering::Release);
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.is_killed() {
            return;
        }
        if let Err(e) = self.events.try_send(event) {
            debug!("Session event dropped: {}", e);
        }
    }

    // ----- lifecycle -----

    /// Connect the transport and become active once a key is available
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if matches!(self.lifecycle(), Lifecycle::Starting | Lifecycle::Active) {
            return Ok(());
        }

        self.set_lifecycle(Lifecycle::Starting);
        self.set_connection(ConnectionState::Connecting);
        self.spawn_driver().await;
        info!("Starting session over {}", self.transport.describe());

        if let Err(e) = self.transport.connect().await {
            warn!("Failed to connect {}: {}", self.transport.describe(), e);
            self.set_lifecycle(Lifecycle::Restarting);
            self.set_connection(ConnectionState::Restarting);
            self.reconnecting.store(true, Ordering::Release);
            self.emit(SessionEvent::NeedsRestart);
            return Err(e.into());
        }

        self.on_transport_ready().await
    }

    /// Transport reports it is ready to transmit
    pub async fn on_transport_ready(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.set_connection(ConnectionState::Active);

        if !self.state.has_key().await {
            info!("Transport {} ready, waiting for a key", self.transport.describe());
            self.emit(SessionEvent::KeyNeeded);
            return Ok(());
        }
        self.activate().await
    }

    /// Transport reports a failure; queues survive for the reconnect
    pub fn on_transport_error(&self, error: TransportError) {
        if self.is_killed() || self.lifecycle() == Lifecycle::Stopped {
            return;
        }
        warn!(
            "Transport {} failed: {}; session needs restart",
            self.transport.describe(),
            error
        );
        self.set_lifecycle(Lifecycle::Restarting);
        self.set_connection(ConnectionState::Restarting);
        self.reconnecting.store(true, Ordering::Release);
        self.emit(SessionEvent::NeedsRestart);
    }

    /// Become active when both the connection and a key are there
    async fn activate(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.session_state() != ConnectionState::Active
            || !matches!(self.lifecycle(), Lifecycle::Starting | Lifecycle::Active)
            || !self.state.has_key().await
        {
            return Ok(());
        }

        if self.lifecycle() != Lifecycle::Active && self.set_lifecycle(Lifecycle::Active) {
            let session_id = self.state.session_id().await;
            info!(
                "Session {:#x} active over {}",
                session_id,
                self.transport.describe()
            );
        }
        if self.reconnecting.swap(false, Ordering::AcqRel) {
            self.resend_all().await?;
        }
        self.send_anything().await
    }

    /// Tear the transport down and reconnect, keeping every queue
    pub async fn restart(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        info!("Restarting session over {}", self.transport.describe());
        self.set_lifecycle(Lifecycle::Restarting);
        self.set_connection(ConnectionState::Restarting);
        self.reconnecting.store(true, Ordering::Release);
        self.transport.restart().await;
        self.start().await
    }

    /// Stop timers and close the transport, keeping every queue
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.set_lifecycle(Lifecycle::Stopped);
        self.set_connection(ConnectionState::Inactive);
        self.reconnecting.store(true, Ordering::Release);
        self.abort_driver().await;
        *self.send_deadline.lock().await = None;
        self.transport.stop().await;
        info!("Session stopped");
        Ok(())
    }

    /// Terminate the session for good.
    ///
    /// Outstanding requests are dropped without firing their handlers, and
    /// every later operation returns [`SessionError::Killed`].
    pub async fn kill(&self) {
        let previous = self
            .lifecycle
            .swap(Lifecycle::Killed as u8, Ordering::AcqRel);
        if previous == Lifecycle::Killed as u8 {
            return;
        }

        info!("Killing session");
        self.state.close();
        self.set_connection(ConnectionState::Inactive);
        self.abort_driver().await;
        self.transport.stop().await;

        let dropped = self.state.reset_all().await;
        self.state.clear_delivery().await;
        self.handlers.clear();
        self.keepalive.clear();
        debug!("Dropped {} outstanding requests", dropped.len());
    }

    // ----- key and layer -----

    /// Key exchange finished; unblocks sending
    pub async fn on_key_established(self: &Arc<Self>, key: AuthKey) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if self.state.set_key(Some(key)).await {
            self.layer_request.store(0, Ordering::Release);
            self.resend_all().await?;
        }
        self.activate().await
    }

    /// Drop the key; sending pauses until the next key is established
    pub async fn destroy_key(&self) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if !self.state.set_key(None).await {
            return Ok(());
        }

        self.layer_request.store(0, Ordering::Release);
        if self.lifecycle() == Lifecycle::Active {
            self.set_lifecycle(Lifecycle::Starting);
        }
        info!("Key destroyed, waiting for a new one");
        self.emit(SessionEvent::KeyNeeded);
        Ok(())
    }

    /// Layer negotiation finished (or was invalidated)
    pub async fn on_layer_initialized(self: &Arc<Self>, initialized: bool) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.state.set_layer_initialized(initialized).await;
        self.layer_request.store(0, Ordering::Release);

        if initialized {
            info!("Protocol layer {} initialised", self.config.layer);
            self.emit(SessionEvent::LayerInitialized);
            self.schedule_send(Duration::ZERO).await?;
        }
        Ok(())
    }

    /// Claim the layer declaration for `id`, or confirm it already holds it
    fn claim_layer_request(&self, id: RequestId) -> bool {
        match self
            .layer_request
            .compare_exchange(0, id.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == id.0,
        }
    }

    // ----- requests -----

    /// Queue a caller request; its result arrives through `handler`
    pub async fn enqueue<R>(
        self: &Arc<Self>,
        request: &R,
        handler: ResponseHandler,
        options: SendOptions,
    ) -> Result<RequestId, SessionError>
    where
        R: Serializable + ?Sized,
    {
        self.ensure_alive()?;
        let body = request.to_bytes();
        if body.len() > MAX_REQUEST_SIZE {
            return Err(WireError::Size(body.len()).into());
        }

        let id = self.next_request_id();
        let mut request = Request::new(
            id,
            RequestKind::Rpc,
            body,
            options.max_wait.unwrap_or(self.config.resend_timeout),
        );
        request.flags = options.flags();
        request.after = options.after;

        self.handlers.insert(id, handler);
        debug!("Enqueued request {} ({} bytes)", id, request.body.len());

        self.flush(request, options.can_wait, true).await?;
        Ok(id)
    }

    /// Put `request` in the send queue and schedule a send pass within `can_wait`.
    ///
    /// Every transmission gets a new message id. For a fresh send any earlier
    /// stamp is simply discarded; for a retry the old message id is remembered
    /// in the resend queue so a late answer to it still resolves the request.
    pub async fn flush(
        self: &Arc<Self>,
        mut request: Request,
        can_wait: Duration,
        fresh: bool,
    ) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let previous = request.clear_stamp();
        if fresh {
            request.attempts = 0;
        } else {
            request.attempts += 1;
            if let Some(old) = previous {
                let mut to_resend = self.state.to_resend().write().await;
                self.ensure_alive()?;
                to_resend.insert(old, request.id);
            }
        }

        {
            let mut to_send = self.state.to_send().write().await;
            self.ensure_alive()?;
            to_send.insert(request.id, request);
        }
        self.schedule_send(can_wait).await
    }

    /// Retransmit the message sent as `msg_id` under a new message id.
    ///
    /// Containers resend their inner messages; state queries put their ids
    /// back into the query queue; unanswered pings are dropped. With
    /// `request_peer_state` the peer is also asked what became of `msg_id`.
    /// Returns the caller request that was queued again, if any.
    pub async fn resend(
        self: &Arc<Self>,
        msg_id: MessageId,
        can_wait: Duration,
        force_batch: bool,
        request_peer_state: bool,
    ) -> Result<Option<RequestId>, SessionError> {
        self.ensure_alive()?;
        if force_batch {
            self.force_batch.store(true, Ordering::Release);
        }

        let mut pending = vec![msg_id];
        let mut resent = None;
        while let Some(msg_id) = pending.pop() {
            let Some(request) = self.state.have_sent().write().await.remove(&msg_id) else {
                trace!("Nothing to resend for msg_id={}", msg_id);
                continue;
            };

            match request.kind.clone() {
                RequestKind::Container { inner } => pending.extend(inner),
                RequestKind::StateRequest { ids } => {
                    let mut state_request = self.state.state_request().write().await;
                    self.ensure_alive()?;
                    state_request.extend(ids);
                }
                RequestKind::Ping { ping_id } => {
                    debug!("Dropping unanswered ping {} (msg_id={})", ping_id, msg_id);
                }
                RequestKind::Rpc => {
                    if request_peer_state {
                        let mut state_request = self.state.state_request().write().await;
                        self.ensure_alive()?;
                        state_request.insert(msg_id);
                    }
                    debug!("Resending request {} (was msg_id={})", request.id, msg_id);
                    resent = Some(request.id);
                    self.flush(request, can_wait, false).await?;
                }
                RequestKind::Pong | RequestKind::Ack | RequestKind::StateInfo => {}
            }
        }
        Ok(resent)
    }

    /// Resend several messages; returns how many caller requests were queued again
    pub async fn resend_many(
        self: &Arc<Self>,
        ids: &[MessageId],
        can_wait: Duration,
        force_batch: bool,
        request_peer_state: bool,
    ) -> Result<usize, SessionError> {
        let mut resent = 0;
        for msg_id in ids {
            if self
                .resend(*msg_id, can_wait, force_batch, request_peer_state)
                .await?
                .is_some()
            {
                resent += 1;
            }
        }
        Ok(resent)
    }

    /// Requeue every sent message, e.g. after a reconnect
    pub async fn resend_all(self: &Arc<Self>) -> Result<usize, SessionError> {
        self.ensure_alive()?;
        let ids: Vec<MessageId> = self.state.have_sent().read().await.keys().copied().collect();
        if ids.is_empty() {
            return Ok(0);
        }
        info!("Resending {} sent messages", ids.len());
        self.resend_many(&ids, self.config.resend_delay, true, false)
            .await
    }

    /// Cancel a request wherever it is; a late answer to it is discarded
    pub async fn cancel(
        &self,
        request_id: RequestId,
        msg_id: Option<MessageId>,
    ) -> Result<bool, SessionError> {
        self.ensure_alive()?;
        let had_handler = self.handlers.remove(&request_id).is_some();
        let queued = self
            .state
            .to_send()
            .write()
            .await
            .remove(&request_id)
            .is_some();

        let sent = {
            let mut have_sent = self.state.have_sent().write().await;
            let before = have_sent.len();
            match msg_id {
                Some(msg_id) if have_sent.get(&msg_id).map(|r| r.id) == Some(request_id) => {
                    have_sent.remove(&msg_id);
                }
                _ => have_sent.retain(|_, request| request.id != request_id),
            }
            have_sent.len() != before
        };

        self.state
            .to_resend()
            .write()
            .await
            .retain(|_, id| *id != request_id);
        self.state
            .received_responses()
            .write()
            .await
            .remove(&request_id);
        // Releases the layer claim only when this request holds it
        self.layer_request
            .compare_exchange(request_id.0, 0, Ordering::AcqRel, Ordering::Acquire)
            .ok();

        debug!(
            "Cancelled request {} (queued={}, sent={})",
            request_id, queued, sent
        );
        Ok(had_handler || queued || sent)
    }

    /// Process acknowledgements from the peer
    pub async fn acknowledge(self: &Arc<Self>, ids: &[MessageId]) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let mut pending = ids.to_vec();
        let mut newly_acked = Vec::new();
        let mut unknown = Vec::new();
        {
            let mut have_sent = self.state.have_sent().write().await;
            self.ensure_alive()?;
            while let Some(msg_id) = pending.pop() {
                let inner = match have_sent.get_mut(&msg_id) {
                    None => {
                        unknown.push(msg_id);
                        continue;
                    }
                    Some(request) => match &request.kind {
                        RequestKind::Container { inner } => inner.clone(),
                        _ => {
                            if !request.acked {
                                request.acked = true;
                                newly_acked.push((msg_id, request.id));
                            }
                            continue;
                        }
                    },
                };
                // A container is acked through its messages
                have_sent.remove(&msg_id);
                pending.extend(inner);
            }
        }

        if !unknown.is_empty() {
            let were_acked = self.state.were_acked().read().await;
            for msg_id in unknown {
                if were_acked.contains_key(&msg_id) {
                    trace!("Duplicate ack for msg_id={}", msg_id);
                } else {
                    debug!("Ack for unknown msg_id={}", msg_id);
                }
            }
        }

        if newly_acked.is_empty() {
            return Ok(());
        }
        trace!("{} messages acknowledged", newly_acked.len());
        {
            let mut were_acked = self.state.were_acked().write().await;
            self.ensure_alive()?;
            were_acked.extend(newly_acked);
        }

        if !self.state.to_send().read().await.is_empty() {
            self.schedule_send(Duration::ZERO).await?;
        }
        Ok(())
    }

    // ----- keepalive -----

    /// Send a liveness ping; returns its ping id
    pub async fn ping(self: &Arc<Self>) -> Result<u64, SessionError> {
        self.ensure_alive()?;
        let ping_id = self.keepalive.record_ping();
        let request = Request::new(
            self.next_request_id(),
            RequestKind::Ping { ping_id },
            Body::Ping { ping_id }.encode(),
            self.config.ping_timeout,
        );
        {
            let mut to_send = self.state.to_send().write().await;
            self.ensure_alive()?;
            to_send.insert(request.id, request);
        }
        debug!("Queued ping {}", ping_id);

        self.schedule_send(Duration::ZERO).await?;
        Ok(ping_id)
    }

    async fn ping_if_active(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.lifecycle() != Lifecycle::Active || self.keepalive.has_outstanding() {
            return Ok(());
        }
        self.ping().await.map(|_| ())
    }

    /// Answer a ping carried by the peer message `msg_id`
    pub async fn on_peer_ping(self: &Arc<Self>, msg_id: MessageId, ping_id: u64) -> Result<(), SessionError> {
        self.ensure_alive()?;
        debug!("Received ping {} (msg_id={})", ping_id, msg_id);
        self.send_pong(msg_id, ping_id).await
    }

    /// Queue a pong and send it right away
    pub async fn send_pong(self: &Arc<Self>, msg_id: MessageId, ping_id: u64) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.queue_service(RequestKind::Pong, Body::Pong { msg_id, ping_id }, Duration::ZERO)
            .await
    }

    pub(crate) async fn queue_service(
        self: &Arc<Self>,
        kind: RequestKind,
        body: Body,
        can_wait: Duration,
    ) -> Result<(), SessionError> {
        let request = Request::new(
            self.next_request_id(),
            kind,
            body.encode(),
            self.config.resend_timeout,
        );
        {
            let mut to_send = self.state.to_send().write().await;
            self.ensure_alive()?;
            to_send.insert(request.id, request);
        }
        self.schedule_send(can_wait).await
    }

    // ----- periodic sweep -----

    /// Act on overdue messages and bound bookkeeping memory.
    ///
    /// Small overdue messages are resent, large ones get a state query.
    /// Containers and state queries past their lifetime are forgotten.
    /// Only queues work; the actual send happens on the next send pass.
    pub async fn sweep(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let now = Instant::now();
        let lifetime = self.config.container_lifetime;
        let mut resend_ids = Vec::new();
        let mut query_ids = Vec::new();
        let mut expired = Vec::new();

        {
            let mut have_sent = self.state.have_sent().write().await;
            self.ensure_alive()?;
            for (msg_id, request) in have_sent.iter_mut() {
                match &request.kind {
                    RequestKind::Container { .. } | RequestKind::StateRequest { .. } => {
                        let expires = request
                            .sent_at
                            .and_then(|sent| sent.checked_add(lifetime));
                        if expires.map_or(false, |at| at < now) {
                            expired.push(*msg_id);
                        }
                    }
                    _ if request.overdue(now) => {
                        if request.body.len() < self.config.resend_threshold {
                            resend_ids.push(*msg_id);
                        } else {
                            request.sent_at = Some(now);
                            query_ids.push(*msg_id);
                        }
                    }
                    _ => {}
                }
            }
            for msg_id in &expired {
                have_sent.remove(msg_id);
            }
        }

        if !expired.is_empty() {
            debug!("Forgot {} expired containers and state queries", expired.len());
        }
        if !query_ids.is_empty() {
            debug!("Querying peer state of {} overdue messages", query_ids.len());
            let mut state_request = self.state.state_request().write().await;
            self.ensure_alive()?;
            state_request.extend(query_ids.iter().copied());
        }
        if !resend_ids.is_empty() {
            debug!("Resending {} overdue messages", resend_ids.len());
            self.resend_many(&resend_ids, self.config.resend_delay, true, false)
                .await?;
        }

        if let Some(age) = self.keepalive.overdue(self.config.ping_timeout) {
            warn!("Ping unanswered for {:?}, session needs restart", age);
            self.keepalive.clear();
            self.emit(SessionEvent::NeedsRestart);
        }

        self.state.received_ids().write().await.shrink_to_capacity();
        {
            let capacity = self.config.id_window_capacity;
            let mut were_acked = self.state.were_acked().write().await;
            while were_acked.len() > capacity {
                were_acked.pop_first();
            }
        }

        if !query_ids.is_empty() {
            self.schedule_send(self.config.resend_delay).await?;
        }
        Ok(())
    }

    // ----- send path -----

    /// Run a send pass now, or once `can_wait` elapses
    pub(crate) async fn schedule_send(self: &Arc<Self>, can_wait: Duration) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if can_wait.is_zero() {
            return self.send_anything().await;
        }

        let Some(at) = Instant::now().checked_add(can_wait) else {
            trace!("Send wait {:?} never elapses, leaving it to the next pass", can_wait);
            return Ok(());
        };
        {
            let mut deadline = self.send_deadline.lock().await;
            *deadline = Some(deadline.map_or(at, |current| current.min(at)));
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Send pass scheduled by the driver
    async fn flush_due(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let mut deadline = self.send_deadline.lock().await;
            match *deadline {
                Some(at) if at <= Instant::now() => *deadline = None,
                _ => return Ok(()),
            }
        }
        self.send_anything().await
    }

    async fn can_send(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
            && self.session_state() == ConnectionState::Active
            && self.state.has_key().await
    }

    /// Transmit pending acks, state queries and every eligible queued request.
    ///
    /// More than one message (or a forced batch) goes out as one container.
    /// Whatever does not fit one container is sent by further passes.
    pub async fn send_anything(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        loop {
            if !self.can_send().await {
                trace!("Send pass skipped, session is {}", self.lifecycle());
                return Ok(());
            }

            let (batch, more) = self.next_batch().await;
            if batch.is_empty() {
                return Ok(());
            }
            let force = self.force_batch.swap(false, Ordering::AcqRel);
            self.transmit_batch(batch, force).await?;
            if !more {
                return Ok(());
            }
        }
    }

    /// Collect the messages of one transmission; the flag reports leftovers
    async fn next_batch(&self) -> (Vec<Outgoing>, bool) {
        let mut batch = Vec::new();

        let (acks, more_acks) = {
            let mut to_ack = self.state.to_ack().write().await;
            let taken = to_ack.len().min(MAX_ACKS_PER_PASS);
            let acks: Vec<MessageId> = to_ack.drain(..taken).collect();
            (acks, !to_ack.is_empty())
        };
        for chunk in acks.chunks(MAX_IDS_PER_ACK) {
            let body = Body::MsgsAck {
                ids: chunk.to_vec(),
            };
            batch.push(self.service_outgoing(RequestKind::Ack, body));
        }

        let queried: Vec<MessageId> = std::mem::take(&mut *self.state.state_request().write().await)
            .into_iter()
            .collect();
        if !queried.is_empty() {
            let body = Body::MsgsStateReq {
                ids: queried.clone(),
            };
            batch.push(self.service_outgoing(RequestKind::StateRequest { ids: queried }, body));
        }

        let used = CONTAINER_HEADER_SIZE
            + batch
                .iter()
                .map(|outgoing| INNER_HEADER_SIZE + outgoing.wire.len())
                .sum::<usize>();
        let room = self.config.max_container_messages.saturating_sub(batch.len());
        let (ready, more_ready) = self
            .take_ready(room, MAX_BODY_SIZE.saturating_sub(used))
            .await;
        batch.extend(ready);

        (batch, more_acks || more_ready)
    }

    fn service_outgoing(&self, kind: RequestKind, body: Body) -> Outgoing {
        let wire = body.encode();
        let request = Request::new(
            self.next_request_id(),
            kind,
            wire.clone(),
            self.config.resend_timeout,
        );
        Outgoing { request, wire }
    }

    /// Take queued requests whose dependency and layer allow sending.
    ///
    /// At most `room` requests are taken, and together they occupy at most
    /// `budget` bytes of a container. The flag reports eligible requests that
    /// were left queued for lack of room.
    async fn take_ready(&self, room: usize, budget: usize) -> (Vec<Outgoing>, bool) {
        let now = Instant::now();
        let layer_initialized = self.state.layer_initialized().await;
        let candidates: Vec<(RequestId, Option<RequestId>, bool, usize)> = {
            let to_send = self.state.to_send().read().await;
            to_send
                .values()
                .filter(|request| request.not_before.map_or(true, |at| at <= now))
                .map(|request| {
                    (
                        request.id,
                        request.after,
                        request.flags.contains(RequestFlags::NEEDS_LAYER),
                        request.body.len(),
                    )
                })
                .collect()
        };

        let mut budget = budget;
        let mut left_over = false;
        let mut chosen = BTreeSet::new();
        for (id, after, needs_layer, len) in candidates {
            if chosen.len() >= room {
                left_over = true;
                break;
            }
            if let Some(dependency) = after {
                let state = self.state.request_state(dependency).await;
                if !matches!(
                    state,
                    RequestState::NotFound | RequestState::Acked | RequestState::Completed
                ) {
                    trace!("Request {} waits for {} ({:?})", id, dependency, state);
                    continue;
                }
            }

            let wrapped = needs_layer && !layer_initialized;
            let cost = INNER_HEADER_SIZE + len + if wrapped { LAYER_WRAPPER_SIZE } else { 0 };
            if cost > budget {
                trace!("Request {} ({} bytes) left for the next pass", id, len);
                left_over = true;
                continue;
            }
            if wrapped && !self.claim_layer_request(id) {
                trace!("Request {} waits for layer initialisation", id);
                continue;
            }
            budget -= cost;
            chosen.insert(id);
        }
        if chosen.is_empty() {
            return (Vec::new(), left_over);
        }

        let taken: Vec<Request> = {
            let mut to_send = self.state.to_send().write().await;
            chosen.iter().filter_map(|id| to_send.remove(id)).collect()
        };
        self.state
            .to_resend()
            .write()
            .await
            .retain(|_, id| !chosen.contains(id));

        let outgoing = taken
            .into_iter()
            .map(|request| {
                let wire = if request.flags.contains(RequestFlags::NEEDS_LAYER) && !layer_initialized {
                    Body::InvokeWithLayer {
                        layer: self.config.layer,
                        query: request.body.clone(),
                    }
                    .encode()
                } else {
                    request.body.clone()
                };
                Outgoing { request, wire }
            })
            .collect();
        (outgoing, left_over)
    }

    /// Encoded body size of `batch`, with or without a container around it
    fn batch_body_size(batch: &[Outgoing], container: bool) -> usize {
        let messages: usize = batch.iter().map(|outgoing| outgoing.wire.len()).sum();
        if container {
            CONTAINER_HEADER_SIZE + batch.len() * INNER_HEADER_SIZE + messages
        } else {
            messages
        }
    }

    /// Put caller requests and pings of an unsendable batch back in the send queue
    async fn requeue(&self, batch: Vec<Outgoing>) -> Result<(), SessionError> {
        let mut to_send = self.state.to_send().write().await;
        self.ensure_alive()?;
        for Outgoing { request, .. } in batch {
            if matches!(request.kind, RequestKind::Rpc | RequestKind::Ping { .. }) {
                to_send.insert(request.id, request);
            }
        }
        Ok(())
    }

    /// Stamp, wrap in an envelope (and a container if needed) and transmit.
    ///
    /// The size is checked before anything is stamped, so a batch that cannot
    /// be encoded leaves no trace in the sent queue.
    async fn transmit_batch(self: &Arc<Self>, batch: Vec<Outgoing>, force: bool) -> Result<(), SessionError> {
        let to_primary_dc = batch
            .iter()
            .any(|outgoing| outgoing.request.flags.contains(RequestFlags::TO_PRIMARY_DC));
        let count = batch.len();
        let container = force || count > 1;

        let size = Self::batch_body_size(&batch, container);
        if size > MAX_BODY_SIZE {
            warn!("Batch of {} messages is {} bytes, requeueing", count, size);
            self.requeue(batch).await?;
            return Err(WireError::Size(size).into());
        }

        let mut stamped: Vec<(MessageId, SeqNo, Bytes)> = Vec::with_capacity(count);
        for Outgoing { request, wire } in batch {
            let (msg_id, request) = self
                .state
                .stamp(request)
                .await
                .ok_or(SessionError::Killed)?;
            trace!(
                "Stamped request {} msg_id={} seq_no={}",
                request.id,
                msg_id,
                request.seq_no
            );
            stamped.push((msg_id, request.seq_no, wire));
        }

        let (msg_id, seq_no, body) = match stamped.pop() {
            Some(single) if !container => single,
            last => {
                stamped.extend(last);
                let messages: Vec<InnerMessage> = stamped
                    .into_iter()
                    .map(|(msg_id, seq_no, body)| InnerMessage {
                        msg_id,
                        seq_no,
                        body,
                    })
                    .collect();
                let inner = messages.iter().map(|message| message.msg_id).collect();
                let body = Body::Container { messages }.encode();
                let container = Request::new(
                    self.next_request_id(),
                    RequestKind::Container { inner },
                    body.clone(),
                    self.config.container_lifetime,
                );
                let (msg_id, container) = self
                    .state
                    .stamp(container)
                    .await
                    .ok_or(SessionError::Killed)?;
                (msg_id, container.seq_no, body)
            }
        };

        let (session_id, salt) = self.state.envelope_identity().await;
        let payload = Envelope::new(salt, session_id, msg_id, seq_no, body).encode()?;
        debug!(
            "Sending msg_id={} seq_no={} ({} messages, {} bytes)",
            msg_id,
            seq_no,
            count,
            payload.len()
        );

        let frame = OutboundFrame {
            msg_id,
            seq_no,
            payload,
            to_primary_dc,
        };
        if let Err(e) = self.transport.transmit(frame).await {
            self.on_transport_error(e);
        }
        Ok(())
    }

    // ----- results -----

    /// Map a peer error through the error policy and act on it
    pub async fn classify_and_dispatch_error(
        self: &Arc<Self>,
        request_id: RequestId,
        error: PeerError,
    ) -> Result<ErrorAction, SessionError> {
        self.ensure_alive()?;
        let request = self.take_request(request_id).await;
        if request.is_none() && !self.handlers.contains_key(&request_id) {
            return Err(SessionError::UnknownRequest(request_id));
        }
        self.dispatch_failure(request_id, request, error).await
    }

    /// Remove a request from whichever outbound queue holds it
    async fn take_request(&self, request_id: RequestId) -> Option<Request> {
        let queued = self.state.to_send().write().await.remove(&request_id);
        if queued.is_some() {
            return queued;
        }

        let mut have_sent = self.state.have_sent().write().await;
        let msg_id = have_sent
            .iter()
            .find(|(_, request)| request.id == request_id)
            .map(|(msg_id, _)| *msg_id)?;
        have_sent.remove(&msg_id)
    }

    pub(crate) async fn dispatch_failure(
        self: &Arc<Self>,
        request_id: RequestId,
        request: Option<Request>,
        error: PeerError,
    ) -> Result<ErrorAction, SessionError> {
        let attempts = request.as_ref().map_or(0, |request| request.attempts);
        let action = self.policy.classify(&error, attempts);
        let retry_at = match action {
            ErrorAction::Retry { delay } => Instant::now().checked_add(delay),
            ErrorAction::Deliver => None,
        };
        match (action, retry_at, request) {
            (ErrorAction::Retry { delay }, Some(at), Some(mut request)) => {
                info!(
                    "Retrying request {} in {:?} after {}",
                    request_id, delay, error
                );
                request.not_before = Some(at);
                self.flush(request, delay, false).await?;
                Ok(ErrorAction::Retry { delay })
            }
            _ => {
                debug!("Delivering {} to request {}", error, request_id);
                self.deliver(request_id, Response::Failed(error)).await;
                Ok(ErrorAction::Deliver)
            }
        }
    }

    /// Queue a completed result for the processing side
    pub(crate) async fn deliver(&self, request_id: RequestId, response: Response) {
        if !self.handlers.contains_key(&request_id) {
            debug!("Dropping result for cancelled request {}", request_id);
            return;
        }
        {
            let mut received = self.state.received_responses().write().await;
            if self.is_killed() {
                return;
            }
            received.insert(request_id, response);
        }
        self.emit(SessionEvent::ReceivedReady);
    }

    /// Fire handlers for completed requests and pass updates on, in order.
    ///
    /// Returns the number of callbacks fired.
    pub async fn try_to_receive(&self) -> Result<usize, SessionError> {
        self.ensure_alive()?;
        let responses = std::mem::take(&mut *self.state.received_responses().write().await);
        let mut delivered = 0;

        for (request_id, response) in responses {
            self.ensure_alive()?;
            match self.handlers.remove(&request_id) {
                Some((_, handler)) => {
                    handler.fire(request_id, response);
                    delivered += 1;
                }
                None => trace!("Request {} was cancelled before delivery", request_id),
            }
        }

        let updates: Vec<Bytes> = self.state.received_updates().write().await.drain(..).collect();
        if updates.is_empty() {
            return Ok(delivered);
        }

        let handler = self.update_handler.read().await;
        match handler.as_ref() {
            Some(handler) => {
                for update in updates {
                    self.ensure_alive()?;
                    handler(update);
                    delivered += 1;
                }
            }
            None => debug!("Dropping {} updates, no update handler", updates.len()),
        }
        Ok(delivered)
    }

    // ----- session expiry -----

    /// Peer invalidated the session: start a new one and requeue outstanding requests
    pub(crate) async fn on_session_expired(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let session_id = rand::random();
        warn!("Peer invalidated the session, starting {:#x}", session_id);

        let outstanding = self.state.reset_all().await;
        self.ensure_alive()?;
        self.state.set_session(session_id).await;
        self.layer_request.store(0, Ordering::Release);
        self.keepalive.clear();

        let mut requeued = 0;
        {
            let mut to_send = self.state.to_send().write().await;
            self.ensure_alive()?;
            for request in outstanding {
                if self.handlers.contains_key(&request.id) {
                    to_send.insert(request.id, request);
                    requeued += 1;
                }
            }
        }

        self.emit(SessionEvent::SessionReset { requeued });
        self.schedule_send(Duration::ZERO).await
    }

    // ----- driver -----

    async fn spawn_driver(self: &Arc<Self>) {
        let mut driver = self.driver.lock().await;
        if driver.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let wake = Arc::clone(&self.wake);
        *driver = Some(tokio::spawn(drive(
            weak,
            wake,
            self.config.sweep_interval,
            self.config.ping_interval,
        )));
    }

    async fn abort_driver(&self) {
        if let Some(handle) = self.driver.lock().await.take() {
            handle.abort();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Cancel driver task
        if let Ok(mut guard) = self.driver.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("lifecycle", &self.lifecycle())
            .field("connection", &self.session_state())
            .field("transport", &self.transport.describe())
            .finish()
    }
}

/// Timer loop: periodic sweep, liveness pings and delayed send passes
async fn drive(
    weak: Weak<SessionController>,
    wake: Arc<Notify>,
    sweep_every: Duration,
    ping_every: Duration,
) {
    let sweep_every = sweep_every.clamp(Duration::from_millis(1), MAX_TIMER_PERIOD);
    let ping_every = ping_every.clamp(Duration::from_millis(1), MAX_TIMER_PERIOD);
    let mut sweep = interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<Instant> = None;

    loop {
        let tick = tokio::select! {
            _ = sweep.tick() => DriverTick::Sweep,
            _ = ping.tick() => DriverTick::Ping,
            _ = wake.notified() => DriverTick::Wake,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => DriverTick::Send,
        };

        let Some(controller) = weak.upgrade() else {
            break;
        };
        if controller.is_killed() {
            break;
        }

        let result = match tick {
            DriverTick::Sweep => controller.sweep().await,
            DriverTick::Ping => controller.ping_if_active().await,
            DriverTick::Wake => Ok(()),
            DriverTick::Send => controller.flush_due().await,
        };
        if let Err(e) = result {
            debug!("Session driver {:?} step failed: {}", tick, e);
        }

        deadline = *controller.send_deadline.lock().await;
    }

    debug!("Session driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn transmit(&self, _frame: OutboundFrame) -> Result<(), TransportError> {
            Ok(())
        }

        async fn restart(&self) {}

        async fn stop(&self) {}
    }

    async fn active_controller() -> Arc<SessionController> {
        let (controller, _events) =
            SessionController::new(SessionConfig::default(), Arc::new(NullTransport));
        controller.start().await.unwrap();
        controller
            .on_key_established(AuthKey::new(1, Bytes::from_static(b"key")))
            .await
            .unwrap();
        controller
    }

    fn rpc(id: u64, body: Bytes) -> Request {
        Request::new(RequestId(id), RequestKind::Rpc, body, Duration::from_secs(10))
    }

    #[test]
    fn test_controller_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionController>();
        assert_send_sync::<Arc<SessionController>>();
    }

    #[tokio::test]
    async fn test_kill_between_batching_and_stamping() {
        let controller = active_controller().await;
        let request = rpc(50, Bytes::from_static(b"in-flight"));
        controller
            .state()
            .to_send()
            .write()
            .await
            .insert(request.id, request);

        let (batch, more) = controller.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert!(!more);

        controller.kill().await;
        assert!(matches!(
            controller.transmit_batch(batch, false).await,
            Err(SessionError::Killed)
        ));
        assert!(controller.state().have_sent().read().await.is_empty());
        assert!(controller.state().to_send().read().await.is_empty());

        controller.handlers.insert(RequestId(50), ResponseHandler::none());
        controller
            .deliver(RequestId(50), Response::Done(Bytes::from_static(b"late")))
            .await;
        assert!(controller.state().received_responses().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_batch_is_requeued_unstamped() {
        let controller = active_controller().await;
        let half = Bytes::from(vec![0x5a; MAX_BODY_SIZE / 2]);
        let batch = vec![
            Outgoing {
                request: rpc(60, half.clone()),
                wire: half.clone(),
            },
            Outgoing {
                request: rpc(61, half.clone()),
                wire: half,
            },
        ];

        assert!(matches!(
            controller.transmit_batch(batch, false).await,
            Err(SessionError::Wire(WireError::Size(_)))
        ));
        assert!(controller.state().have_sent().read().await.is_empty());
        let to_send = controller.state().to_send().read().await;
        assert_eq!(
            to_send.keys().copied().collect::<Vec<_>>(),
            vec![RequestId(60), RequestId(61)]
        );
    }

    #[tokio::test]
    async fn test_take_ready_respects_byte_budget() {
        let controller = active_controller().await;
        {
            let mut to_send = controller.state().to_send().write().await;
            to_send.insert(RequestId(70), rpc(70, Bytes::from(vec![1u8; 600])));
            to_send.insert(RequestId(71), rpc(71, Bytes::from(vec![2u8; 600])));
            to_send.insert(RequestId(72), rpc(72, Bytes::from(vec![3u8; 100])));
        }

        let (taken, more) = controller.take_ready(10, 1000).await;
        let ids: Vec<RequestId> = taken.iter().map(|outgoing| outgoing.request.id).collect();
        assert_eq!(ids, vec![RequestId(70), RequestId(72)]);
        assert!(more);
        assert!(controller
            .state()
            .to_send()
            .read()
            .await
            .contains_key(&RequestId(71)));

        let (taken, more) = controller.take_ready(10, 1000).await;
        assert_eq!(taken.len(), 1);
        assert!(!more);
    }

    #[test]
    fn test_largest_request_fits_wrapped_in_container() {
        let body = Bytes::from(vec![0u8; MAX_REQUEST_SIZE]);
        let wire = Body::InvokeWithLayer { layer: 1, query: body.clone() }.encode();
        let batch = vec![Outgoing {
            request: rpc(80, body),
            wire,
        }];
        assert_eq!(
            SessionController::batch_body_size(&batch, true),
            MAX_BODY_SIZE
        );
    }
}
