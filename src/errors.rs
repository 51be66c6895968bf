//! Errors surfaced by the work manager facade.

use thiserror::Error;
use txwork_job::WorkState;

/// Errors that can occur while scheduling or inspecting work.
#[derive(Error, Debug)]
pub enum WorkManagerError {
    /// `schedule` was called on work that is not freshly scheduled.
    #[error("work must be in state {expected:?} to be scheduled, found {actual:?}")]
    InvalidState {
        expected: WorkState,
        actual: WorkState,
    },

    /// No descriptor is registered for the requested queue id.
    #[error("no work queue registered with id '{0}'")]
    UnknownQueue(String),

    /// The category has no binding and no default queue is registered.
    #[error("no queue accepts category '{0}' and no default queue is registered")]
    UnboundCategory(String),

    /// The manager has been shut down; its pools are gone.
    #[error("work manager has been shut down")]
    ShutDown,
}

/// A Result type alias for work manager operations.
pub type Result<T> = std::result::Result<T, WorkManagerError>;
