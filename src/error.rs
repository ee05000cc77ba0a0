use thiserror::Error;

use crate::dispatcher::BatchOutcome;

/// Fault raised while opening or reading a token stream.
///
/// A stream either completes or fails as a whole; whatever text was
/// accumulated before the fault is discarded.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed stream event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server reported an error: {0}")]
    Server(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Failure of a single [`GenerationTask`](crate::GenerationTask).
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The task was aborted by dispatcher-level cancellation. This is not a
    /// fault of the request itself.
    #[error("generation cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Errors surfaced by [`BoundedDispatcher`](crate::BoundedDispatcher).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
    /// Fail-fast policy: the batch stopped at the first failing request.
    /// `outcome` keeps every result that completed before the abort.
    #[error("batch aborted: request {first_index} failed")]
    Aborted {
        first_index: usize,
        outcome: BatchOutcome,
    },
}

impl DispatchError {
    /// The error of the request that triggered a fail-fast abort.
    pub fn first_error(&self) -> Option<&StreamError> {
        match self {
            DispatchError::Aborted {
                first_index,
                outcome,
            } => outcome.get(*first_index).and_then(|slot| slot.error()),
            DispatchError::InvalidConfig(_) => None,
        }
    }
}

/// Continue-on-error batch in which one or more requests did not complete.
#[derive(Debug, Error)]
#[error("{} of {} requests did not complete", .failed.len(), .outcome.len())]
pub struct BatchPartialFailure {
    /// Indices that failed, were cancelled or never started.
    pub failed: Vec<usize>,
    /// Full per-index outcome, completed results included.
    pub outcome: BatchOutcome,
}
