use forge_core::CoreError;
use forge_model::Signature;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("claim on {signature} is not held by {holder}")]
    NotHeld { signature: Signature, holder: String },

    #[error("claim store unavailable: {0}")]
    Unavailable(String),
}

impl ClaimError {
    /// Store outages are retried; ownership errors are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClaimError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum AuctionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed auction payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid auction: {0}")]
    InvalidAuction(String),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("fulfillment failed: {0}")]
    Fulfill(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<AuctionError> for CoreError {
    fn from(e: AuctionError) -> Self {
        match e {
            AuctionError::Core(inner) => inner,
            other => CoreError::Publish(other.to_string()),
        }
    }
}
