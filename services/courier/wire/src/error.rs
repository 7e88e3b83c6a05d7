//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the structure did
    #[error("incomplete message: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required to continue decoding
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Declared body length does not match the buffer
    #[error("body length mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Length actually present
        actual: usize,
    },

    /// Body is empty, no constructor to read
    #[error("empty body")]
    Empty,

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in string field")]
    Utf8,

    /// Malformed structure
    #[error("malformed {0}")]
    Malformed(&'static str),
}
