//! Courier
//!
//! Session reliability layer for an RPC protocol client. The heavy lifting
//! lives in [`session`] (request lifecycle, acks, resends, timers) and
//! [`wire`] (message ids, envelopes, service-message bodies); this crate adds
//! configuration loading and log setup for embedders.
//!
//! ```no_run
//! # async fn run(transport: std::sync::Arc<dyn courier::session::Transport>) -> anyhow::Result<()> {
//! let config = courier::CourierConfig::load_from_file("courier.yaml")?;
//! courier::init_logging("courier", &config.log_level)?;
//!
//! let (session, mut events) = courier::SessionController::new(config.session, transport);
//! session.start().await?;
//! while let Some(event) = events.recv().await {
//!     if event == courier::SessionEvent::ReceivedReady {
//!         session.try_to_receive().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub use courier_session as session;
pub use courier_wire as wire;

pub use config::CourierConfig;
pub use courier_session::{
    AuthKey, ErrorAction, ErrorPolicy, RequestId, ResponseHandler, SendOptions, SessionConfig,
    SessionController, SessionError, SessionEvent, Transport,
};
pub use logging::{init_logging, CourierLogFormatter};
