use std::time::Duration;

use crate::{AuthError, TokenScheme};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Upper bound on one credential exchange.
    pub exchange_timeout: Duration,
    /// Lifetime of a session when the request outlives it.
    pub session_ttl: Duration,
    /// Token schemes accepted at all.
    pub schemes: Vec<TokenScheme>,
}

impl AuthConfig {
    pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.exchange_timeout.is_zero() {
            return Err(AuthError::InvalidConfig(
                "exchange_timeout must be positive".into(),
            ));
        }
        if self.session_ttl.is_zero() {
            return Err(AuthError::InvalidConfig(
                "session_ttl must be positive".into(),
            ));
        }
        if self.schemes.is_empty() {
            return Err(AuthError::InvalidConfig(
                "at least one token scheme must be enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn accepts(&self, scheme: TokenScheme) -> bool {
        self.schemes.contains(&scheme)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Self::DEFAULT_EXCHANGE_TIMEOUT,
            session_ttl: Self::DEFAULT_SESSION_TTL,
            schemes: TokenScheme::ALL.to_vec(),
        }
    }
}
