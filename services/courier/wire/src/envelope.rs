//! Message envelopes.
//!
//! Every message travels inside an envelope that names the session it belongs
//! to, its [`MessageId`] and its [`SeqNo`]. Messages packed into a container
//! use the shorter [`InnerMessage`] header, since the container's envelope
//! already carries the salt and session.

use crate::ids::{MessageId, SeqNo};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Envelope header size in bytes
pub const ENVELOPE_HEADER_SIZE: usize = 32;

/// Byte offset of the sequence number inside a serialized envelope
pub const SEQ_NO_OFFSET: usize = 24;

/// Inner (container) message header size in bytes
pub const INNER_HEADER_SIZE: usize = 16;

/// Maximum body size (1 MiB)
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Read the ack-required bit of a serialized envelope.
///
/// Only the fixed-offset sequence field is inspected, so this works on any
/// message without interpreting its body. Buffers too short to hold a header
/// never require an ack.
pub fn response_needs_ack(message: &[u8]) -> bool {
    if message.len() < ENVELOPE_HEADER_SIZE {
        return false;
    }
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&message[SEQ_NO_OFFSET..SEQ_NO_OFFSET + 4]);
    SeqNo(u32::from_le_bytes(seq)).needs_ack()
}

/// Envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Server salt the message was sent under
    pub salt: u64,
    /// Session identity
    pub session_id: u64,
    /// Message id
    pub msg_id: MessageId,
    /// Sequence number
    pub seq_no: SeqNo,
    /// Body length in bytes
    pub body_len: u32,
}

impl EnvelopeHeader {
    /// Encode the header (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.salt);
        buf.put_u64_le(self.session_id);
        buf.put_u64_le(self.msg_id.0);
        buf.put_u32_le(self.seq_no.0);
        buf.put_u32_le(self.body_len);
    }

    /// Decode the header (little-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < ENVELOPE_HEADER_SIZE {
            return Err(WireError::Incomplete {
                needed: ENVELOPE_HEADER_SIZE,
                available: buf.len(),
            });
        }

        Ok(Self {
            salt: buf.get_u64_le(),
            session_id: buf.get_u64_le(),
            msg_id: MessageId(buf.get_u64_le()),
            seq_no: SeqNo(buf.get_u32_le()),
            body_len: buf.get_u32_le(),
        })
    }
}

/// A complete message: header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope header
    pub header: EnvelopeHeader,
    /// Serialized body
    pub body: Bytes,
}

impl Envelope {
    /// Create an envelope, filling in the body length
    pub fn new(salt: u64, session_id: u64, msg_id: MessageId, seq_no: SeqNo, body: Bytes) -> Self {
        Self {
            header: EnvelopeHeader {
                salt,
                session_id,
                msg_id,
                seq_no,
                body_len: body.len() as u32,
            },
            body,
        }
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(WireError::Size(self.body.len()));
        }

        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.body.len());
        let mut header = self.header;
        header.body_len = self.body.len() as u32;
        header.encode(&mut buf);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode from a buffer holding exactly one message
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let header = EnvelopeHeader::decode(&mut buf)?;
        let declared = header.body_len as usize;

        if declared > MAX_BODY_SIZE {
            return Err(WireError::Size(declared));
        }
        if declared != buf.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }

        Ok(Self { header, body: buf })
    }
}

/// A message inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMessage {
    /// Message id
    pub msg_id: MessageId,
    /// Sequence number
    pub seq_no: SeqNo,
    /// Serialized body
    pub body: Bytes,
}

impl InnerMessage {
    /// Encoded size including the header
    pub fn encoded_size(&self) -> usize {
        INNER_HEADER_SIZE + self.body.len()
    }

    /// Append the encoded message to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.msg_id.0);
        buf.put_u32_le(self.seq_no.0);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Decode one message from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < INNER_HEADER_SIZE {
            return Err(WireError::Incomplete {
                needed: INNER_HEADER_SIZE,
                available: buf.len(),
            });
        }

        let msg_id = MessageId(buf.get_u64_le());
        let seq_no = SeqNo(buf.get_u32_le());
        let len = buf.get_u32_le() as usize;

        if len > MAX_BODY_SIZE {
            return Err(WireError::Size(len));
        }
        if buf.len() < len {
            return Err(WireError::Incomplete {
                needed: len,
                available: buf.len(),
            });
        }

        Ok(Self {
            msg_id,
            seq_no,
            body: buf.split_to(len),
        })
    }
}
