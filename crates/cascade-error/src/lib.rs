#![warn(missing_docs)]

//! Typed error types for outbound HTTP dispatch.
//!
//! Provides [`ForwardError`], the canonical error type for every seam that
//! issues an HTTP request on behalf of a batch: the `http` action forwarder
//! and the `fetch` capability injected into sandboxed scripts.

use thiserror::Error;

/// Canonical error type for outbound HTTP operations.
///
/// Only transport-level failures are represented here. A response with a
/// non-2xx status is a successful dispatch; interpreting the status is the
/// caller's business.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ForwardError {
    /// The request could not be built (bad method, unparseable URL, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request was built but the exchange with the remote host failed.
    #[error("request to '{url}' failed: {message}")]
    Transport {
        /// The target URL.
        url: String,
        /// Transport-level failure description.
        message: String,
    },

    /// The remote host did not answer within the configured deadline.
    #[error("request to '{url}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The target URL.
        url: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ForwardError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::InvalidRequest(_) => false,
            Self::Internal(_) => false,
        }
    }
}

// Compile-time assertion: ForwardError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<ForwardError>();
};
