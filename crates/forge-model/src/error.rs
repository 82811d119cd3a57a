use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid job status: '{0}' (valid: queued, running, successful, failed, cancelled)")]
    InvalidStatus(String),

    #[error("invalid resource kind: '{0}' (valid: database, storage)")]
    InvalidResourceKind(String),

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
}
