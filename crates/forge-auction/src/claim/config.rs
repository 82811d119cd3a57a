use std::time::Duration;

use forge_model::RetryPolicy;

use crate::AuctionError;

/// Worker-side claim protocol settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimConfig {
    /// Lifetime of a hold; renewed every third of it while fulfilling.
    pub claim_ttl: Duration,
    /// How long a seen `Cancel` suppresses a late `New`.
    pub negative_ttl: Duration,
    /// Retries of claim store calls while the store is unavailable.
    pub store_retry: RetryPolicy,
    /// Retries of a failing fulfillment before the job is failed.
    pub fulfill_retry: RetryPolicy,
    /// How long a need waits for another job's hold on the same signature
    /// before its job is failed.
    pub park_timeout: Duration,
}

impl ClaimConfig {
    pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);
    pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(600);
    pub const DEFAULT_PARK_TIMEOUT: Duration = Duration::from_secs(600);

    pub fn validate(&self) -> Result<(), AuctionError> {
        if self.claim_ttl < Duration::from_millis(3) {
            return Err(AuctionError::InvalidConfig(format!(
                "claim_ttl must be at least 3ms, got {:?}",
                self.claim_ttl
            )));
        }
        if self.negative_ttl.is_zero() {
            return Err(AuctionError::InvalidConfig(
                "negative_ttl must be positive".into(),
            ));
        }
        if self.park_timeout.is_zero() {
            return Err(AuctionError::InvalidConfig(
                "park_timeout must be positive".into(),
            ));
        }
        self.store_retry
            .validate()
            .map_err(|e| AuctionError::InvalidConfig(format!("store_retry: {e}")))?;
        self.fulfill_retry
            .validate()
            .map_err(|e| AuctionError::InvalidConfig(format!("fulfill_retry: {e}")))?;
        Ok(())
    }

    /// Period of hold renewals.
    pub fn renew_every(&self) -> Duration {
        (self.claim_ttl / 3).max(Duration::from_millis(1))
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Self::DEFAULT_CLAIM_TTL,
            negative_ttl: Self::DEFAULT_NEGATIVE_TTL,
            store_retry: RetryPolicy::default(),
            fulfill_retry: RetryPolicy {
                attempts: 3,
                first_ms: 500,
                max_ms: 10_000,
                factor: 2.0,
            },
            park_timeout: Self::DEFAULT_PARK_TIMEOUT,
        }
    }
}
