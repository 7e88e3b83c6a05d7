//! Transport collaborator interface.
//!
//! The session layer never touches sockets or ciphers. It hands serialized
//! envelopes to a [`Transport`] and is fed decrypted envelopes back through
//! [`SessionController::on_incoming_frame`](crate::SessionController::on_incoming_frame).

use async_trait::async_trait;
use bytes::Bytes;
use courier_wire::{MessageId, SeqNo};

use crate::error::TransportError;

/// One serialized message ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Message id of the envelope
    pub msg_id: MessageId,
    /// Sequence number of the envelope
    pub seq_no: SeqNo,
    /// Serialized plaintext envelope
    pub payload: Bytes,
    /// Route to the primary datacenter
    pub to_primary_dc: bool,
}

/// Connection that frames, encrypts and physically moves bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection; Ok means ready to transmit
    async fn connect(&self) -> Result<(), TransportError>;

    /// Transmit one frame
    async fn transmit(&self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Tear the connection down ahead of a reconnect
    async fn restart(&self);

    /// Close the connection for good
    async fn stop(&self);

    /// Short description for logs
    fn describe(&self) -> String {
        "transport".to_string()
    }
}
