//! Error types for the session layer.

use courier_wire::WireError;
use thiserror::Error;

use crate::request::RequestId;

/// Errors returned by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was killed; it is inert from now on
    #[error("session was killed")]
    Killed,

    /// Outgoing message could not be encoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Transport could not be (re)established
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No queue holds the given request
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
}

/// Failures reported by the transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be opened
    #[error("connect failed: {0}")]
    Connect(String),

    /// Connection dropped while in use
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Transport was stopped and does not accept frames
    #[error("transport closed")]
    Closed,
}

/// Structured error returned by the peer for one request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("peer error {code}: {message}")]
pub struct PeerError {
    /// Peer error code
    pub code: i32,
    /// Peer error text
    pub message: String,
}

impl PeerError {
    /// Create a peer error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
