//! HTTP client for the forge job API.

use std::time::Duration;

use forge_auth::{AuthError, Credential};
use forge_model::{Job, JobId, JobMeta};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    ErrorBody, JobResponse, ProjectJobsResponse, SubmitJobRequest, SubmitJobResponse,
    error::ApiError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// API client for forge job endpoints.
#[derive(Debug, Clone)]
pub struct JobsClient {
    http: Client,
    base_url: String,
    credential: Option<Credential>,
}

impl JobsClient {
    /// Client without a credential; every call fails with `AuthRequired`
    /// until one is set with [`JobsClient::with_credential`].
    pub fn new(base_url: impl Into<String>) -> Self {
        // No total timeout here: log streams stay open for as long as the job runs.
        let http = match Client::builder().connect_timeout(CONNECT_TIMEOUT).build() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "failed to configure reqwest client; using defaults");
                Client::new()
            }
        };
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Ids of every job of `project`.
    pub async fn jobs(&self, project: &str) -> Result<Vec<JobId>, ApiError> {
        let req = self.http.get(self.url(&format!("/jobs/{project}")));
        let body: ProjectJobsResponse = self.call(req).await?;
        Ok(body.job_ids)
    }

    pub async fn job(&self, id: &JobId) -> Result<Job, ApiError> {
        let req = self.http.get(self.url(&format!("/job/{id}")));
        let body: JobResponse = self.call(req).await?;
        Ok(body.job)
    }

    pub async fn submit(&self, meta: JobMeta) -> Result<JobId, ApiError> {
        let req = self
            .http
            .post(self.url("/jobs"))
            .json(&SubmitJobRequest { meta });
        let body: SubmitJobResponse = self.call(req).await?;
        Ok(body.job_id)
    }

    pub async fn cancel(&self, id: &JobId) -> Result<Job, ApiError> {
        let req = self.http.post(self.url(&format!("/cancel/{id}")));
        let body: JobResponse = self.call(req).await?;
        Ok(body.job)
    }

    pub async fn retry(&self, id: &JobId) -> Result<Job, ApiError> {
        let req = self.http.post(self.url(&format!("/retry/{id}")));
        let body: JobResponse = self.call(req).await?;
        Ok(body.job)
    }

    /// Open the log stream of `resource`.
    ///
    /// The stream yields lines until the server closes it or `ctx` is
    /// cancelled, whichever comes first. Cancelling before the server
    /// answers yields a stream that is already over.
    pub async fn log_file(
        &self,
        resource: &str,
        ctx: CancellationToken,
    ) -> Result<LogStream, ApiError> {
        let req = self.authorize(self.http.get(self.url(&format!("/logs/{resource}"))))?;

        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(%resource, "log request cancelled before response");
                return Ok(LogStream::ended(ctx));
            }
            sent = req.send() => sent.map_err(|e| ApiError::Upstream(e.to_string()))?,
        };
        let response = check(response).await?;
        debug!(%resource, "log stream opened");

        Ok(LogStream {
            response: Some(response),
            ctx,
            pending: Vec::new(),
            done: false,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let credential = self
            .credential
            .as_ref()
            .ok_or(ApiError::Auth(AuthError::AuthRequired))?;
        Ok(req.header(header::AUTHORIZATION, credential.header_value()))
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let req = self.authorize(req)?.timeout(REQUEST_TIMEOUT);
        let response = req
            .send()
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;
        check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("malformed response: {e}")))
    }
}

/// Maps non-success statuses onto `ApiError`.
async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::UNAUTHORIZED => ApiError::Auth(AuthError::InvalidCredential(message)),
        _ => ApiError::Upstream(format!("{status}: {message}")),
    })
}

/// Line-oriented reader over a streaming log response.
pub struct LogStream {
    response: Option<Response>,
    ctx: CancellationToken,
    pending: Vec<u8>,
    done: bool,
}

impl LogStream {
    fn ended(ctx: CancellationToken) -> Self {
        Self {
            response: None,
            ctx,
            pending: Vec::new(),
            done: true,
        }
    }

    /// Next log line, or `None` once the stream ended or was cancelled.
    pub async fn next_line(&mut self) -> Result<Option<String>, ApiError> {
        loop {
            if self.ctx.is_cancelled() {
                return Ok(None);
            }
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(Some(
                    String::from_utf8_lossy(&line[..line.len() - 1]).into_owned(),
                ));
            }
            if self.done {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.pending);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            }

            let Some(response) = self.response.as_mut() else {
                self.done = true;
                continue;
            };
            let chunk = tokio::select! {
                _ = self.ctx.cancelled() => return Ok(None),
                chunk = response.chunk() => {
                    chunk.map_err(|e| ApiError::Upstream(e.to_string()))?
                }
            };
            match chunk {
                Some(bytes) => self.pending.extend_from_slice(&bytes),
                None => self.done = true,
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }
}
