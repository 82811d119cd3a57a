use forge_model::{Attempt, JobId, JobStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("log resource not found: {0}")]
    LogNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid state: job {id} is {status}: {reason}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        reason: &'static str,
    },

    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("stale attempt for job {id}: reported {reported}, current is {current}")]
    StaleAttempt {
        id: JobId,
        reported: Attempt,
        current: Attempt,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("publish error: {0}")]
    Publish(String),
}

impl CoreError {
    /// Infrastructure failures a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Storage(_) | CoreError::Publish(_))
    }
}
