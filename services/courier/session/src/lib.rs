//! Courier Session Layer
//!
//! Reliable request/response delivery on top of an unreliable transport:
//! message ids and sequence numbers, duplicate detection, acknowledgements,
//! retransmission, batching into containers, keepalive and session identity.
//!
//! The network side feeds decrypted envelopes into
//! [`SessionController::on_incoming_frame`] and transmits what the controller
//! hands to its [`Transport`]. The processing side enqueues requests and
//! collects results through [`SessionController::try_to_receive`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
mod dispatch;
pub mod error;
pub mod id_window;
pub mod keepalive;
pub mod policy;
pub mod request;
pub mod state;
pub mod transport;

pub use config::SessionConfig;
pub use controller::{
    ConnectionState, Lifecycle, SessionController, SessionEvent, MAX_REQUEST_SIZE,
};
pub use error::{PeerError, SessionError, TransportError};
pub use id_window::{AckLookup, IdWindow};
pub use keepalive::KeepaliveState;
pub use policy::{DeliverToCaller, ErrorAction, ErrorPolicy, RetryWithBackoff};
pub use request::{
    Request, RequestFlags, RequestId, RequestKind, RequestState, Response, ResponseHandler,
    SendOptions, Serializable,
};
pub use state::{AuthKey, SessionState};
pub use transport::{OutboundFrame, Transport};
