//! Pluggable classification of peer errors.
//!
//! The session never decides on its own which peer errors are worth
//! retrying. An [`ErrorPolicy`] supplied by the embedder maps each error to
//! an [`ErrorAction`]; the default hands every error to the caller.

use std::time::Duration;

use crate::error::PeerError;

/// What to do with a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Deliver the error to the request's failure handler
    Deliver,
    /// Send the request again after `delay`
    Retry {
        /// Delay before the retry
        delay: Duration,
    },
}

/// Maps peer errors to actions
pub trait ErrorPolicy: Send + Sync {
    /// Classify `error` for a request that was retried `attempts` times
    fn classify(&self, error: &PeerError, attempts: u32) -> ErrorAction;
}

/// Deliver every error to the caller
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliverToCaller;

impl ErrorPolicy for DeliverToCaller {
    fn classify(&self, _error: &PeerError, _attempts: u32) -> ErrorAction {
        ErrorAction::Deliver
    }
}

/// Retry errors accepted by a predicate with exponential backoff
pub struct RetryWithBackoff<F> {
    retryable: F,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl<F> RetryWithBackoff<F>
where
    F: Fn(&PeerError) -> bool + Send + Sync,
{
    /// Retry errors for which `retryable` holds, at most `max_attempts` times
    pub fn new(retryable: F, base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            retryable,
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before retry number `attempts + 1`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempts.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl<F> ErrorPolicy for RetryWithBackoff<F>
where
    F: Fn(&PeerError) -> bool + Send + Sync,
{
    fn classify(&self, error: &PeerError, attempts: u32) -> ErrorAction {
        if attempts >= self.max_attempts || !(self.retryable)(error) {
            return ErrorAction::Deliver;
        }
        ErrorAction::Retry {
            delay: self.delay_for(attempts),
        }
    }
}
