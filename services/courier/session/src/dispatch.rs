//! Incoming message dispatch.
//!
//! Decrypted envelopes enter through [`SessionController::on_incoming_frame`].
//! Every message id is checked against the id window first; duplicates are
//! acknowledged again but never processed twice.

use bytes::Bytes;
use courier_wire::{msg_state, response_needs_ack, Body, Envelope, MessageId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::controller::{SessionController, SessionEvent};
use crate::error::{PeerError, SessionError};
use crate::request::{Request, RequestKind, Response};

/// Bad-msg codes meaning our message id clock is off
const BAD_MSG_ID_TOO_LOW: i32 = 16;
const BAD_MSG_ID_TOO_HIGH: i32 = 17;
/// Bad-msg codes meaning our sequence numbers no longer match the session
const BAD_SEQ_NO_TOO_LOW: i32 = 32;
const BAD_SEQ_NO_TOO_HIGH: i32 = 33;

impl SessionController {
    /// Process one decrypted envelope from the transport
    pub async fn on_incoming_frame(self: &Arc<Self>, frame: Bytes) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let needs_ack = response_needs_ack(&frame);

        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return Ok(());
            }
        };

        let session_id = self.state.session_id().await;
        if envelope.header.session_id != session_id {
            warn!(
                "Dropping msg_id={} for session {:#x}, current session is {:#x}",
                envelope.header.msg_id, envelope.header.session_id, session_id
            );
            return Ok(());
        }
        if !self.state.key_checked().await {
            debug!("Peer accepted the key of session {:#x}", session_id);
            self.state.set_key_checked(true).await;
        }

        self.handle_message(envelope.header.msg_id, needs_ack, envelope.body)
            .await?;

        if !self.state.to_ack().read().await.is_empty() {
            self.schedule_send(self.config.ack_wait).await?;
        }
        Ok(())
    }

    /// Record an incoming id; returns false for duplicates
    async fn register_incoming(&self, msg_id: MessageId, needs_ack: bool) -> Result<bool, SessionError> {
        let fresh = {
            let mut window = self.state.received_ids().write().await;
            self.ensure_alive()?;
            window.register(msg_id, needs_ack)
        };
        if needs_ack {
            let mut to_ack = self.state.to_ack().write().await;
            self.ensure_alive()?;
            to_ack.push(msg_id);
        }
        Ok(fresh)
    }

    async fn handle_message(
        self: &Arc<Self>,
        msg_id: MessageId,
        needs_ack: bool,
        body: Bytes,
    ) -> Result<(), SessionError> {
        if !self.register_incoming(msg_id, needs_ack).await? {
            debug!("Duplicate msg_id={}, ignoring", msg_id);
            return Ok(());
        }

        let body = match Body::decode(body) {
            Ok(body) => body,
            Err(e) => {
                warn!("Dropping msg_id={} with malformed body: {}", msg_id, e);
                return Ok(());
            }
        };

        let Body::Container { messages } = body else {
            return self.handle_body(msg_id, body).await;
        };

        trace!("Container msg_id={} with {} messages", msg_id, messages.len());
        for message in messages {
            self.ensure_alive()?;
            if !self
                .register_incoming(message.msg_id, message.seq_no.needs_ack())
                .await?
            {
                debug!("Duplicate msg_id={} in container, ignoring", message.msg_id);
                continue;
            }
            match Body::decode(message.body) {
                Ok(Body::Container { .. }) => {
                    warn!("Nested container msg_id={}, ignoring", message.msg_id);
                }
                Ok(inner) => self.handle_body(message.msg_id, inner).await?,
                Err(e) => warn!(
                    "Dropping msg_id={} with malformed body: {}",
                    message.msg_id, e
                ),
            }
        }
        Ok(())
    }

    async fn handle_body(self: &Arc<Self>, msg_id: MessageId, body: Body) -> Result<(), SessionError> {
        match body {
            Body::MsgsAck { ids } => self.acknowledge(&ids).await,
            Body::RpcResult { req_msg_id, result } => {
                self.complete_request(req_msg_id, Response::Done(result))
                    .await
            }
            Body::RpcError {
                req_msg_id,
                code,
                message,
            } => {
                self.complete_request(req_msg_id, Response::Failed(PeerError::new(code, message)))
                    .await
            }
            Body::Pong { msg_id: ping_msg_id, ping_id } => {
                self.state.have_sent().write().await.remove(&ping_msg_id);
                match self.keepalive.process_pong(ping_id) {
                    Some(rtt) => {
                        debug!("Pong {} after {:?}", ping_id, rtt);
                        self.emit(SessionEvent::Pong { rtt });
                    }
                    None => debug!("Pong for unknown ping {}", ping_id),
                }
                Ok(())
            }
            Body::Ping { ping_id } => self.on_peer_ping(msg_id, ping_id).await,
            Body::BadServerSalt {
                bad_msg_id,
                new_salt,
                ..
            } => {
                debug!("Server salt changed to {:#x}, resending msg_id={}", new_salt, bad_msg_id);
                self.state.set_salt(new_salt).await;
                self.resend(bad_msg_id, Duration::ZERO, false, false)
                    .await
                    .map(|_| ())
            }
            Body::BadMsgNotification {
                bad_msg_id,
                error_code,
                ..
            } => self.on_bad_msg(msg_id, bad_msg_id, error_code).await,
            Body::NewSessionCreated {
                first_msg_id,
                unique_id,
                server_salt,
            } => {
                debug!(
                    "Peer created session {:#x}, first msg_id={}",
                    unique_id, first_msg_id
                );
                self.state.set_salt(server_salt).await;
                let lost: Vec<MessageId> = self
                    .state
                    .have_sent()
                    .read()
                    .await
                    .range(..first_msg_id)
                    .map(|(id, _)| *id)
                    .collect();
                if !lost.is_empty() {
                    debug!("Resending {} messages sent before the new session", lost.len());
                    self.resend_many(&lost, Duration::ZERO, false, false)
                        .await?;
                }
                Ok(())
            }
            Body::MsgsStateReq { ids } => {
                let info: Vec<u8> = {
                    let window = self.state.received_ids().read().await;
                    ids.iter().map(|id| window.state_of(*id)).collect()
                };
                self.queue_service(
                    RequestKind::StateInfo,
                    Body::MsgsStateInfo {
                        req_msg_id: msg_id,
                        info: Bytes::from(info),
                    },
                    Duration::ZERO,
                )
                .await
            }
            Body::MsgsStateInfo { req_msg_id, info } => self.on_state_info(req_msg_id, info).await,
            Body::MsgResendReq { ids } => self.on_resend_request(msg_id, ids).await,
            Body::InvokeWithLayer { layer, .. } => {
                warn!("Unexpected layer {} wrapper from peer, ignoring", layer);
                Ok(())
            }
            Body::Opaque(update) => {
                trace!("Update msg_id={} ({} bytes)", msg_id, update.len());
                {
                    let mut updates = self.state.received_updates().write().await;
                    self.ensure_alive()?;
                    updates.push_back(update);
                }
                self.emit(SessionEvent::ReceivedReady);
                Ok(())
            }
            Body::Container { .. } => {
                warn!("Nested container msg_id={}, ignoring", msg_id);
                Ok(())
            }
        }
    }

    async fn on_bad_msg(
        self: &Arc<Self>,
        msg_id: MessageId,
        bad_msg_id: MessageId,
        error_code: i32,
    ) -> Result<(), SessionError> {
        match error_code {
            BAD_MSG_ID_TOO_LOW | BAD_MSG_ID_TOO_HIGH => {
                debug!(
                    "Message id clock off (code {}), resending msg_id={}",
                    error_code, bad_msg_id
                );
                self.state.id_generator().sync_with(msg_id);
                self.resend(bad_msg_id, Duration::ZERO, false, false)
                    .await
                    .map(|_| ())
            }
            BAD_SEQ_NO_TOO_LOW | BAD_SEQ_NO_TOO_HIGH => {
                warn!(
                    "Sequence numbers out of sync (code {}), resetting session",
                    error_code
                );
                self.on_session_expired().await
            }
            _ => {
                warn!(
                    "Peer rejected msg_id={} with code {}, resending",
                    bad_msg_id, error_code
                );
                self.resend(bad_msg_id, Duration::ZERO, false, false)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Answer to one of our state queries
    async fn on_state_info(self: &Arc<Self>, req_msg_id: MessageId, info: Bytes) -> Result<(), SessionError> {
        let query = self.state.have_sent().write().await.remove(&req_msg_id);
        let ids = match query.map(|request| request.kind) {
            Some(RequestKind::StateRequest { ids }) => ids,
            _ => {
                debug!("State info for unknown query msg_id={}", req_msg_id);
                return Ok(());
            }
        };
        if ids.len() != info.len() {
            warn!(
                "State info for msg_id={} has {} entries, expected {}",
                req_msg_id,
                info.len(),
                ids.len()
            );
        }

        let mut lost = Vec::new();
        let mut received = Vec::new();
        for (id, state) in ids.into_iter().zip(info.iter().copied()) {
            if msg_state::not_received(state) {
                lost.push(id);
            } else if msg_state::base(state) == msg_state::RECEIVED {
                received.push(id);
            }
        }

        if !received.is_empty() {
            let now = Instant::now();
            let mut have_sent = self.state.have_sent().write().await;
            self.ensure_alive()?;
            for id in &received {
                if let Some(request) = have_sent.get_mut(id) {
                    request.sent_at = Some(now);
                    request.max_wait = self.config.resend_waiting;
                }
            }
        }

        if !lost.is_empty() {
            debug!("Peer never received {} messages, resending", lost.len());
            self.resend_many(&lost, Duration::ZERO, false, false)
                .await?;
        }
        Ok(())
    }

    /// Peer asks us to retransmit; unknown ids are reported back as unknown
    async fn on_resend_request(
        self: &Arc<Self>,
        msg_id: MessageId,
        ids: Vec<MessageId>,
    ) -> Result<(), SessionError> {
        let (known, unknown): (Vec<MessageId>, Vec<MessageId>) = {
            let have_sent = self.state.have_sent().read().await;
            ids.into_iter().partition(|id| have_sent.contains_key(id))
        };

        if !known.is_empty() {
            self.resend_many(&known, Duration::ZERO, false, false)
                .await?;
        }
        if !unknown.is_empty() {
            debug!("Peer asked to resend {} unknown messages", unknown.len());
            let info = vec![msg_state::UNKNOWN; unknown.len()];
            self.queue_service(
                RequestKind::StateInfo,
                Body::MsgsStateInfo {
                    req_msg_id: msg_id,
                    info: Bytes::from(info),
                },
                Duration::ZERO,
            )
            .await?;
        }
        Ok(())
    }

    /// Result (or error) for the request sent as `req_msg_id`
    async fn complete_request(
        self: &Arc<Self>,
        req_msg_id: MessageId,
        response: Response,
    ) -> Result<(), SessionError> {
        let sent = self.state.have_sent().write().await.remove(&req_msg_id);
        let request = match sent {
            Some(request) => Some(request),
            None => self.find_resent(req_msg_id).await,
        };
        let Some(request) = request else {
            debug!("Result for unknown msg_id={}, dropping", req_msg_id);
            return Ok(());
        };

        if request.kind != RequestKind::Rpc {
            debug!("Result for non-request msg_id={}, dropping", req_msg_id);
            return Ok(());
        }
        let request_id = request.id;
        if !self.handlers.contains_key(&request_id) {
            debug!("Result for cancelled request {}, dropping", request_id);
            return Ok(());
        }

        self.state
            .to_resend()
            .write()
            .await
            .retain(|_, id| *id != request_id);
        if self
            .layer_request
            .load(std::sync::atomic::Ordering::Acquire)
            == request_id.0
        {
            self.on_layer_initialized(true).await?;
        }

        match response {
            Response::Done(result) => {
                trace!("Request {} completed ({} bytes)", request_id, result.len());
                self.deliver(request_id, Response::Done(result)).await;
            }
            Response::Failed(error) => {
                self.dispatch_failure(request_id, Some(request), error)
                    .await?;
            }
        }

        if !self.state.to_send().read().await.is_empty() {
            self.schedule_send(Duration::ZERO).await?;
        }
        Ok(())
    }

    /// Late answer to an older transmission of a request queued for resend
    async fn find_resent(&self, old_msg_id: MessageId) -> Option<Request> {
        let request_id = self.state.to_resend().write().await.remove(&old_msg_id)?;

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
}
