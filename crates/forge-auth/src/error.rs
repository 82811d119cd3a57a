use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credential was presented.
    #[error("authentication required")]
    AuthRequired,

    /// The credential was presented but could not be verified.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("invalid auth config: {0}")]
    InvalidConfig(String),
}
