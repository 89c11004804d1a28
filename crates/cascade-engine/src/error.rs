//! Batch-level errors.

use cascade_error::ForwardError;
use cascade_sandbox::SandboxError;
use thiserror::Error;

/// Why a batch produced no results.
///
/// Unknown action kinds are not errors; they become result entries.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch was malformed. Nothing ran.
    #[error("{0}")]
    Validation(String),

    /// A `code` action failed.
    #[error(transparent)]
    Execution(#[from] SandboxError),

    /// An `http` action failed at the transport level.
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl BatchError {
    /// Whether the caller sent a bad batch, as opposed to a failure while running it.
    pub fn is_validation(&self) -> bool {
        matches!(self, BatchError::Validation(_))
    }
}
