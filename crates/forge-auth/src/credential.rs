use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::AuthError;

/// Kind of external token a client presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScheme {
    Github,
    #[serde(rename = "oauth")]
    OAuth,
}

impl TokenScheme {
    pub const ALL: [TokenScheme; 2] = [TokenScheme::Github, TokenScheme::OAuth];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScheme::Github => "github",
            TokenScheme::OAuth => "oauth",
        }
    }
}

impl fmt::Display for TokenScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenScheme {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(TokenScheme::Github),
            "oauth" => Ok(TokenScheme::OAuth),
            _ => Err(AuthError::AuthRequired),
        }
    }
}

/// A raw token and the scheme it was presented under.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub scheme: TokenScheme,
    pub token: String,
}

impl Credential {
    pub fn new(scheme: TokenScheme, token: impl Into<String>) -> Self {
        Self {
            scheme,
            token: token.into(),
        }
    }

    /// Parse an `Authorization: <scheme> <token>` header value.
    ///
    /// A missing header, an unknown scheme or an empty token is `AuthRequired`.
    pub fn from_header(value: Option<&str>) -> Result<Self, AuthError> {
        let value = value.map(str::trim).unwrap_or_default();
        let (scheme, token) = value.split_once(' ').ok_or(AuthError::AuthRequired)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::AuthRequired);
        }
        Ok(Self::new(scheme.parse()?, token))
    }

    /// Value for an outgoing `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A verified external identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Who vouched for the identity (e.g. `github`).
    pub provider: String,
    /// Stable id at the provider.
    pub subject: String,
    /// Human-readable name at the provider.
    pub login: String,
}

/// Exchanges a raw credential for a verified identity.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// `ctx` is cancelled when the caller gives up; implementations should
    /// abandon outstanding network calls then.
    async fn exchange(
        &self,
        credential: &Credential,
        ctx: CancellationToken,
    ) -> Result<Identity, AuthError>;
}
