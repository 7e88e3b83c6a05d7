//! Message bodies.
//!
//! A body starts with a u32 constructor. The constructors below are the
//! service messages the session layer itself speaks; anything else is an
//! [`Body::Opaque`] payload that belongs to the caller (outgoing requests,
//! incoming update pushes).

use crate::envelope::{InnerMessage, MAX_BODY_SIZE};
use crate::ids::{MessageId, SeqNo};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// `rpc_result req_msg_id:long result:Object`
pub const TAG_RPC_RESULT: u32 = 0xf35c_6d01;
/// `rpc_error error_code:int error_message:string`
pub const TAG_RPC_ERROR: u32 = 0x2144_ca19;
/// `msgs_ack msg_ids:Vector<long>`
pub const TAG_MSGS_ACK: u32 = 0x62d6_b459;
/// `ping ping_id:long`
pub const TAG_PING: u32 = 0x7abe_77ec;
/// `pong msg_id:long ping_id:long`
pub const TAG_PONG: u32 = 0x3477_73c5;
/// `msg_container messages:vector<message>`
pub const TAG_MSG_CONTAINER: u32 = 0x73f1_f8dc;
/// `msgs_state_req msg_ids:Vector<long>`
pub const TAG_MSGS_STATE_REQ: u32 = 0xda69_fb52;
/// `msgs_state_info req_msg_id:long info:string`
pub const TAG_MSGS_STATE_INFO: u32 = 0x04de_b57d;
/// `msg_resend_req msg_ids:Vector<long>`
pub const TAG_MSG_RESEND_REQ: u32 = 0x7d86_1a08;
/// `bad_server_salt bad_msg_id:long bad_msg_seqno:int error_code:int new_server_salt:long`
pub const TAG_BAD_SERVER_SALT: u32 = 0xedab_447b;
/// `bad_msg_notification bad_msg_id:long bad_msg_seqno:int error_code:int`
pub const TAG_BAD_MSG_NOTIFICATION: u32 = 0xa7ef_f811;
/// `new_session_created first_msg_id:long unique_id:long server_salt:long`
pub const TAG_NEW_SESSION_CREATED: u32 = 0x9ec2_0908;
/// `invokeWithLayer layer:int query:!X`
pub const TAG_INVOKE_WITH_LAYER: u32 = 0xda9b_0d0d;

/// Maximum number of messages in one container
pub const MAX_CONTAINER_MESSAGES: usize = 1020;

/// Constructor and message count in front of a container's messages
pub const CONTAINER_HEADER_SIZE: usize = 8;

/// Constructor and layer number in front of a wrapped query
pub const LAYER_WRAPPER_SIZE: usize = 8;

/// Per-message state bytes carried by `msgs_state_info`
pub mod msg_state {
    /// Nothing is known about the message
    pub const UNKNOWN: u8 = 1;
    /// Not received, id is below the tracked window
    pub const NOT_RECEIVED_TOO_LOW: u8 = 2;
    /// Not received, id is above the tracked window
    pub const NOT_RECEIVED_TOO_HIGH: u8 = 3;
    /// Received
    pub const RECEIVED: u8 = 4;
    /// Flag: acknowledgement already received
    pub const ACK_RECEIVED: u8 = 8;
    /// Flag: no acknowledgement required
    pub const NO_ACK_NEEDED: u8 = 16;

    /// Strip the flag bits, leaving the base state
    pub fn base(state: u8) -> u8 {
        state & 0x07
    }

    /// Whether the base state says the peer never got the message
    pub fn not_received(state: u8) -> bool {
        matches!(base(state), UNKNOWN | NOT_RECEIVED_TOO_LOW | NOT_RECEIVED_TOO_HIGH)
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Successful result of one of our requests
    RpcResult {
        /// Id of the request message this answers
        req_msg_id: MessageId,
        /// Serialized result object
        result: Bytes,
    },
    /// Error result of one of our requests
    RpcError {
        /// Id of the request message this answers
        req_msg_id: MessageId,
        /// Peer error code
        code: i32,
        /// Peer error text
        message: String,
    },
    /// Acknowledgement of received messages
    MsgsAck {
        /// Acknowledged ids
        ids: Vec<MessageId>,
    },
    /// Liveness probe
    Ping {
        /// Probe identifier echoed in the pong
        ping_id: u64,
    },
    /// Answer to a ping
    Pong {
        /// Id of the message carrying the ping
        msg_id: MessageId,
        /// Echoed probe identifier
        ping_id: u64,
    },
    /// Several messages batched into one
    Container {
        /// Batched messages
        messages: Vec<InnerMessage>,
    },
    /// Query for the delivery state of messages
    MsgsStateReq {
        /// Ids whose state is requested
        ids: Vec<MessageId>,
    },
    /// Answer to a state query, one state byte per queried id
    MsgsStateInfo {
        /// Id of the state query message
        req_msg_id: MessageId,
        /// State bytes, see [`msg_state`]
        info: Bytes,
    },
    /// Request to retransmit messages
    MsgResendReq {
        /// Ids to retransmit
        ids: Vec<MessageId>,
    },
    /// Message was sent under a stale salt
    BadServerSalt {
        /// Rejected message id
        bad_msg_id: MessageId,
        /// Rejected sequence number
        bad_seq_no: SeqNo,
        /// Error code (48)
        error_code: i32,
        /// Salt to use from now on
        new_salt: u64,
    },
    /// Message was rejected for a framing reason
    BadMsgNotification {
        /// Rejected message id
        bad_msg_id: MessageId,
        /// Rejected sequence number
        bad_seq_no: SeqNo,
        /// Reason code
        error_code: i32,
    },
    /// Peer created a fresh session for us
    NewSessionCreated {
        /// First message id the new session knows about
        first_msg_id: MessageId,
        /// Random session marker
        unique_id: u64,
        /// Salt for the new session
        server_salt: u64,
    },
    /// Request wrapped with a protocol layer declaration
    InvokeWithLayer {
        /// Protocol layer number
        layer: u32,
        /// Wrapped request body
        query: Bytes,
    },
    /// Caller-owned payload
    Opaque(Bytes),
}

impl Body {
    /// Whether a message with this body is content-related (odd sequence number)
    pub fn needs_ack(&self) -> bool {
        !matches!(
            self,
            Body::MsgsAck { .. }
                | Body::Container { .. }
                | Body::MsgsStateInfo { .. }
                | Body::Pong { .. }
                | Body::BadServerSalt { .. }
                | Body::BadMsgNotification { .. }
        )
    }

    /// Constructor of an encoded body, if it has one
    pub fn peek_tag(body: &[u8]) -> Option<u32> {
        let head: [u8; 4] = body.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(head))
    }

    /// Encode the body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Body::RpcResult { req_msg_id, result } => {
                buf.put_u32_le(TAG_RPC_RESULT);
                buf.put_u64_le(req_msg_id.0);
                buf.put_slice(result);
            }
            Body::RpcError {
                req_msg_id,
                code,
                message,
            } => {
                buf.put_u32_le(TAG_RPC_RESULT);
                buf.put_u64_le(req_msg_id.0);
                buf.put_u32_le(TAG_RPC_ERROR);
                buf.put_i32_le(*code);
                put_bytes(&mut buf, message.as_bytes());
            }
            Body::MsgsAck { ids } => {
                buf.put_u32_le(TAG_MSGS_ACK);
                put_ids(&mut buf, ids);
            }
            Body::Ping { ping_id } => {
                buf.put_u32_le(TAG_PING);
                buf.put_u64_le(*ping_id);
            }
            Body::Pong { msg_id, ping_id } => {
                buf.put_u32_le(TAG_PONG);
                buf.put_u64_le(msg_id.0);
                buf.put_u64_le(*ping_id);
            }
            Body::Container { messages } => {
                buf.put_u32_le(TAG_MSG_CONTAINER);
                buf.put_u32_le(messages.len() as u32);
                for message in messages {
                    message.encode(&mut buf);
                }
            }
            Body::MsgsStateReq { ids } => {
                buf.put_u32_le(TAG_MSGS_STATE_REQ);
                put_ids(&mut buf, ids);
            }
            Body::MsgsStateInfo { req_msg_id, info } => {
                buf.put_u32_le(TAG_MSGS_STATE_INFO);
                buf.put_u64_le(req_msg_id.0);
                put_bytes(&mut buf, info);
            }
            Body::MsgResendReq { ids } => {
                buf.put_u32_le(TAG_MSG_RESEND_REQ);
                put_ids(&mut buf, ids);
            }
            Body::BadServerSalt {
                bad_msg_id,
                bad_seq_no,
                error_code,
                new_salt,
            } => {
                buf.put_u32_le(TAG_BAD_SERVER_SALT);
                buf.put_u64_le(bad_msg_id.0);
                buf.put_u32_le(bad_seq_no.0);
                buf.put_i32_le(*error_code);
                buf.put_u64_le(*new_salt);
            }
            Body::BadMsgNotification {
                bad_msg_id,
                bad_seq_no,
                error_code,
            } => {
                buf.put_u32_le(TAG_BAD_MSG_NOTIFICATION);
                buf.put_u64_le(bad_msg_id.0);
                buf.put_u32_le(bad_seq_no.0);
                buf.put_i32_le(*error_code);
            }
            Body::NewSessionCreated {
                first_msg_id,
                unique_id,
                server_salt,
            } => {
                buf.put_u32_le(TAG_NEW_SESSION_CREATED);
                buf.put_u64_le(first_msg_id.0);
                buf.put_u64_le(*unique_id);
                buf.put_u64_le(*server_salt);
            }
            Body::InvokeWithLayer { layer, query } => {
                buf.put_u32_le(TAG_INVOKE_WITH_LAYER);
                buf.put_u32_le(*layer);
                buf.put_slice(query);
            }
            Body::Opaque(payload) => buf.put_slice(payload),
        }
        buf.freeze()
    }

    /// Decode a body
    pub fn decode(body: Bytes) -> Result<Self, WireError> {
        if body.len() > MAX_BODY_SIZE {
            return Err(WireError::Size(body.len()));
        }
        let tag = Self::peek_tag(&body).ok_or(WireError::Empty)?;

        let mut buf = body.clone();
        buf.advance(4);

        let decoded = match tag {
            TAG_RPC_RESULT => {
                let req_msg_id = MessageId(get_u64(&mut buf)?);
                if Self::peek_tag(&buf) == Some(TAG_RPC_ERROR) {
                    buf.advance(4);
                    let code = get_i32(&mut buf)?;
                    let message = String::from_utf8(get_bytes(&mut buf)?.to_vec())
                        .map_err(|_| WireError::Utf8)?;
                    Body::RpcError {
                        req_msg_id,
                        code,
                        message,
                    }
                } else {
                    Body::RpcResult {
                        req_msg_id,
                        result: buf.split_off(0),
                    }
                }
            }
            TAG_MSGS_ACK => Body::MsgsAck {
                ids: get_ids(&mut buf)?,
            },
            TAG_PING => Body::Ping {
                ping_id: get_u64(&mut buf)?,
            },
            TAG_PONG => Body::Pong {
                msg_id: MessageId(get_u64(&mut buf)?),
                ping_id: get_u64(&mut buf)?,
            },
            TAG_MSG_CONTAINER => {
                let count = get_u32(&mut buf)? as usize;
                if count > MAX_CONTAINER_MESSAGES {
                    return Err(WireError::Malformed("container size"));
                }
                let mut messages = Vec::with_capacity(count);
                for _ in 0..count {
                    messages.push(InnerMessage::decode(&mut buf)?);
                }
                Body::Container { messages }
            }
            TAG_MSGS_STATE_REQ => Body::MsgsStateReq {
                ids: get_ids(&mut buf)?,
            },
            TAG_MSGS_STATE_INFO => Body::MsgsStateInfo {
                req_msg_id: MessageId(get_u64(&mut buf)?),
                info: get_bytes(&mut buf)?,
            },
            TAG_MSG_RESEND_REQ => Body::MsgResendReq {
                ids: get_ids(&mut buf)?,
            },
            TAG_BAD_SERVER_SALT => Body::BadServerSalt {
                bad_msg_id: MessageId(get_u64(&mut buf)?),
                bad_seq_no: SeqNo(get_u32(&mut buf)?),
                error_code: get_i32(&mut buf)?,
                new_salt: get_u64(&mut buf)?,
            },
            TAG_BAD_MSG_NOTIFICATION => Body::BadMsgNotification {
                bad_msg_id: MessageId(get_u64(&mut buf)?),
                bad_seq_no: SeqNo(get_u32(&mut buf)?),
                error_code: get_i32(&mut buf)?,
            },
            TAG_NEW_SESSION_CREATED => Body::NewSessionCreated {
                first_msg_id: MessageId(get_u64(&mut buf)?),
                unique_id: get_u64(&mut buf)?,
                server_salt: get_u64(&mut buf)?,
            },
            TAG_INVOKE_WITH_LAYER => Body::InvokeWithLayer {
                layer: get_u32(&mut buf)?,
                query: buf.split_off(0),
            },
            _ => return Ok(Body::Opaque(body)),
        };

        Ok(decoded)
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Incomplete {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = get_u32(buf)? as usize;
    if len > MAX_BODY_SIZE {
        return Err(WireError::Size(len));
    }
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_ids(buf: &mut Bytes) -> Result<Vec<MessageId>, WireError> {
    let count = get_u32(buf)? as usize;
    ensure(buf, count.saturating_mul(8))?;
    Ok((0..count).map(|_| MessageId(buf.get_u64_le())).collect())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_ids(buf: &mut BytesMut, ids: &[MessageId]) {
    buf.put_u32_le(ids.len() as u32);
    for id in ids {
        buf.put_u64_le(id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_travels_inside_rpc_result() {
        let body = Body::RpcError {
            req_msg_id: MessageId(400),
            code: 420,
            message: "FLOOD_WAIT_3".to_string(),
        };
        let encoded = body.encode();

        assert_eq!(Body::peek_tag(&encoded), Some(TAG_RPC_RESULT));
        assert_eq!(Body::decode(encoded).unwrap(), body);
    }

    #[test]
    fn test_container_decode() {
        let messages = vec![
            InnerMessage {
                msg_id: MessageId(8),
                seq_no: SeqNo(1),
                body: Body::Ping { ping_id: 77 }.encode(),
            },
            InnerMessage {
                msg_id: MessageId(12),
                seq_no: SeqNo(2),
                body: Body::MsgsAck {
                    ids: vec![MessageId(1), MessageId(5)],
                }
                .encode(),
            },
        ];
        let encoded = Body::Container {
            messages: messages.clone(),
        }
        .encode();

        match Body::decode(encoded).unwrap() {
            Body::Container { messages: decoded } => {
                assert_eq!(decoded, messages);
                assert_eq!(
                    Body::decode(decoded[0].body.clone()).unwrap(),
                    Body::Ping { ping_id: 77 }
                );
            }
            other => panic!("expected container, got {:?}", other),
        }
    }

    #[test]
    fn test_wrapper_overheads() {
        let query = Bytes::from_static(b"query-body");
        let wrapped = Body::InvokeWithLayer {
            layer: 3,
            query: query.clone(),
        }
        .encode();
        assert_eq!(wrapped.len(), LAYER_WRAPPER_SIZE + query.len());

        let message = InnerMessage {
            msg_id: MessageId(4),
            seq_no: SeqNo(1),
            body: wrapped,
        };
        let size = message.encoded_size();
        let container = Body::Container {
            messages: vec![message],
        }
        .encode();
        assert_eq!(container.len(), CONTAINER_HEADER_SIZE + size);
    }

    #[test]
    fn test_unknown_constructor_is_opaque() {
        let payload = Bytes::from_static(&[0x01, 0x02, 0x03, 0x04, 0xFF]);
        assert_eq!(
            Body::decode(payload.clone()).unwrap(),
            Body::Opaque(payload)
        );
    }

    #[test]
    fn test_truncated_service_body_rejected() {
        let encoded = Body::BadServerSalt {
            bad_msg_id: MessageId(16),
            bad_seq_no: SeqNo(3),
            error_code: 48,
            new_salt: 99,
        }
        .encode();

        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(matches!(
            Body::decode(truncated),
            Err(WireError::Incomplete { .. })
        ));
        assert_eq!(Body::decode(Bytes::new()), Err(WireError::Empty));
    }

    #[test]
    fn test_ack_id_vector_bounds_checked() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(TAG_MSGS_ACK);
        buf.put_u32_le(1000);
        buf.put_u64_le(1);

        assert!(Body::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_needs_ack_classification() {
        assert!(Body::Opaque(Bytes::from_static(b"abcd")).needs_ack());
        assert!(Body::Ping { ping_id: 1 }.needs_ack());
        assert!(!Body::MsgsAck { ids: vec![] }.needs_ack());
        assert!(!Body::Container { messages: vec![] }.needs_ack());
    }

    #[test]
    fn test_state_byte_helpers() {
        assert!(msg_state::not_received(msg_state::NOT_RECEIVED_TOO_LOW));
        assert!(!msg_state::not_received(
            msg_state::RECEIVED | msg_state::ACK_RECEIVED
        ));
    }
}
