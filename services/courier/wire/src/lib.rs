//! Wire contract for the courier session layer.
//!
//! This crate owns everything the session layer needs to know about bytes on
//! the wire: message identifiers, sequence numbers, the message envelope,
//! containers that batch several messages into one transmission, and the
//! service bodies (acks, pings, state queries, salts) that the session layer
//! produces and classifies. Request payloads themselves stay opaque.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u64 salt             | server salt                |
//! +----------------------+----------------------------+
//! | u64 session_id       | session identity           |
//! +----------------------+----------------------------+
//! | u64 msg_id           | monotonic message id       |
//! +----------------------+----------------------------+
//! | u32 seq_no           | low bit = ack required     |
//! +----------------------+----------------------------+
//! | u32 body_len         | length of the body         |
//! +----------------------+----------------------------+
//! | body                 | u32 constructor + fields   |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod body;
pub mod envelope;
pub mod error;
pub mod ids;

// Re-export main types
pub use body::{
    msg_state, Body, CONTAINER_HEADER_SIZE, LAYER_WRAPPER_SIZE, MAX_CONTAINER_MESSAGES,
    TAG_BAD_MSG_NOTIFICATION, TAG_BAD_SERVER_SALT, TAG_INVOKE_WITH_LAYER, TAG_MSGS_ACK,
    TAG_MSGS_STATE_INFO, TAG_MSGS_STATE_REQ, TAG_MSG_CONTAINER, TAG_MSG_RESEND_REQ,
    TAG_NEW_SESSION_CREATED, TAG_PING, TAG_PONG, TAG_RPC_ERROR, TAG_RPC_RESULT,
};
pub use envelope::{
    response_needs_ack, Envelope, EnvelopeHeader, InnerMessage, ENVELOPE_HEADER_SIZE,
    INNER_HEADER_SIZE, MAX_BODY_SIZE, SEQ_NO_OFFSET,
};
pub use error::WireError;
pub use ids::{MessageId, MessageIdGenerator, SeqNo};
