use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AuthError, Credential, CredentialProvider, Identity};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "forge";

/// Resolves a token to the GitHub user it belongs to.
///
/// Works for both schemes: a personal token and an OAuth app token are both
/// accepted by `GET /user`. Requests are not time-bounded unless
/// [`GithubProvider::with_timeout`] is used; the session manager bounds the
/// whole exchange anyway.
#[derive(Debug, Clone)]
pub struct GithubProvider {
    http: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
}

impl GithubProvider {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Provider talking to a GitHub-compatible API at `api_base`.
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Bound every GitHub request by `timeout`, e.g. `AuthConfig::exchange_timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "failed to configure reqwest client; using defaults");
                reqwest::Client::new()
            }
        };
        self
    }

    async fn fetch_user(&self, token: &str) -> Result<GithubUser, AuthError> {
        let response = self
            .http
            .get(format!("{}/user", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| AuthError::InvalidCredential(format!("github request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::InvalidCredential(format!(
                "github rejected token: {status}"
            )));
        }
        response
            .json::<GithubUser>()
            .await
            .map_err(|e| AuthError::InvalidCredential(format!("malformed github user: {e}")))
    }
}

impl Default for GithubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for GithubProvider {
    async fn exchange(
        &self,
        credential: &Credential,
        ctx: CancellationToken,
    ) -> Result<Identity, AuthError> {
        let user = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(AuthError::InvalidCredential("exchange cancelled".into()));
            }
            user = self.fetch_user(&credential.token) => user?,
        };
        debug!(login = %user.login, "github token resolved");

        Ok(Identity {
            provider: "github".into(),
            subject: user.id.to_string(),
            login: user.login,
        })
    }
}
