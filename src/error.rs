//! Error types for the command relay.

use thiserror::Error;

use crate::protocol::RequestId;

/// Errors surfaced by the relay core, its listeners and the submission client.
///
/// The `Display` text of the admission variants is what a rejected client
/// sees in the `error` field of its failure result.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A submission line that is not a valid command object.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A completion body that is not a valid result object.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The caller reused an id that is still outstanding.
    #[error("Duplicate requestId {0}: a call with this id is already pending")]
    DuplicateRequestId(RequestId),

    /// The opt-in queue depth cap was reached.
    #[error("Command queue is full ({0} commands waiting)")]
    QueueFull(usize),

    /// The opt-in pending-call cap was reached.
    #[error("Too many pending calls ({0} outstanding)")]
    TooManyPending(usize),

    /// The relay control loop is gone.
    #[error("Relay is shutting down")]
    ShuttingDown,

    /// The client gave up waiting for a result.
    #[error("Timed out after {0:?} waiting for the relay")]
    ClientTimeout(std::time::Duration),

    /// Socket or file-system I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure on an outbound frame.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether a client may reasonably resubmit after seeing this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull(_) | Self::TooManyPending(_) | Self::Io(_) | Self::ShuttingDown
        )
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
