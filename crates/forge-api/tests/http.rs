#![cfg(all(feature = "http", feature = "client"))]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use forge_api::{ApiError, HttpApi, JobsClient, RegistryAdapter};
use forge_auth::{
    AuthConfig, AuthError, AuthSessionManager, Credential, CredentialProvider, Identity,
    TokenScheme,
};
use forge_core::{JobRegistry, MemoryJobStore};
use forge_model::{JobMeta, JobStatus};
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "letmein";

struct StaticProvider;

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn exchange(
        &self,
        credential: &Credential,
        _ctx: CancellationToken,
    ) -> Result<Identity, AuthError> {
        if credential.token != TOKEN {
            return Err(AuthError::InvalidCredential("unknown token".into()));
        }
        Ok(Identity {
            provider: "static".into(),
            subject: "7".into(),
            login: "builder".into(),
        })
    }
}

struct Server {
    base: String,
    registry: Arc<JobRegistry>,
    sessions: Arc<AuthSessionManager>,
}

impl Server {
    async fn start() -> Self {
        let registry = Arc::new(JobRegistry::new(Arc::new(MemoryJobStore::new())));
        let sessions = Arc::new(
            AuthSessionManager::new(Arc::new(StaticProvider), AuthConfig::default()).unwrap(),
        );
        let router = HttpApi::new(
            Arc::new(RegistryAdapter::new(registry.clone())),
            sessions.clone(),
        )
        .router();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            forge_api::axum::serve(listener, router).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            registry,
            sessions,
        }
    }

    fn client(&self) -> JobsClient {
        JobsClient::new(&self.base).with_credential(Credential::new(TokenScheme::Github, TOKEN))
    }
}

fn meta() -> JobMeta {
    JobMeta {
        project_id: "proj".into(),
        repository_id: "42".into(),
        repository: "acme/site".into(),
        provider: "github".into(),
        branch: "main".into(),
        head_commit: "c0ffee".into(),
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn job_lifecycle_round_trip() {
    let server = Server::start().await;
    let client = server.client();

    let id = client.submit(meta()).await.unwrap();
    assert_eq!(client.jobs("proj").await.unwrap(), vec![id.clone()]);
    assert_eq!(client.job(&id).await.unwrap().status, JobStatus::Queued);

    let err = client.retry(&id).await.unwrap_err();
    assert!(matches!(err, ApiError::Upstream(ref m) if m.starts_with("409")));

    let cancelled = client.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let retried = client.retry(&id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.retry_count, 1);

    eventually("sessions to close", || server.sessions.active_sessions() == 0).await;
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let server = Server::start().await;
    let client = server.client();

    assert!(matches!(
        client.job(&"missing".into()).await,
        Err(ApiError::NotFound(_))
    ));
    assert!(matches!(
        client.log_file("missing", CancellationToken::new()).await,
        Err(ApiError::NotFound(_))
    ));
}

#[tokio::test]
async fn credentials_are_enforced() {
    let server = Server::start().await;

    let raw = reqwest::Client::new();
    let response = raw
        .get(format!("{}/jobs/proj", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = raw
        .get(format!("{}/logs/anything", server.base))
        .header("authorization", "bearer abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let wrong = JobsClient::new(&server.base)
        .with_credential(Credential::new(TokenScheme::OAuth, "nope"));
    assert!(matches!(
        wrong.jobs("proj").await,
        Err(ApiError::Auth(AuthError::InvalidCredential(_)))
    ));
    assert_eq!(server.sessions.active_sessions(), 0);
}

#[tokio::test]
async fn incomplete_submission_is_rejected() {
    let server = Server::start().await;
    let mut bad = meta();
    bad.repository_id.clear();

    let err = server.client().submit(bad).await.unwrap_err();
    assert!(matches!(err, ApiError::Upstream(ref m) if m.starts_with("400") && m.contains("repositoryId")));
    assert!(server.registry.list_by_project("proj").await.unwrap().is_empty());
}

#[tokio::test]
async fn listing_filters_by_status() {
    let server = Server::start().await;
    let client = server.client();
    let first = client.submit(meta()).await.unwrap();
    client.submit(meta()).await.unwrap();
    client.cancel(&first).await.unwrap();

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!(
            "{}/api/v1/jobs?project=proj&status=cancelled",
            server.base
        ))
        .header("authorization", format!("github {TOKEN}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["jobs"][0]["id"], first.as_str());

    let response = reqwest::Client::new()
        .get(format!("{}/api/v1/jobs?status=exploded", server.base))
        .header("authorization", format!("github {TOKEN}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn log_streams_follow_and_close_without_leaks() {
    let server = Server::start().await;
    let client = server.client();

    for cycle in 0..3 {
        let resource = format!("build-{cycle}");
        let id = client.submit(meta()).await.unwrap();
        server
            .registry
            .append_log(&id, &resource, "line one")
            .await
            .unwrap();

        let mut stream = client
            .log_file(&resource, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("line one"));

        server
            .registry
            .append_log(&id, &resource, "line two")
            .await
            .unwrap();
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("line two"));

        client.cancel(&id).await.unwrap();
        assert_eq!(stream.next_line().await.unwrap(), None);

        eventually("log readers to close", || {
            server.registry.logs().active_readers() == 0
        })
        .await;
    }
}

#[tokio::test]
async fn cancelled_client_stream_ends_immediately() {
    let server = Server::start().await;
    let client = server.client();
    let id = client.submit(meta()).await.unwrap();
    server
        .registry
        .append_log(&id, "build", "compiling")
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let mut stream = client.log_file("build", ctx.clone()).await.unwrap();
    assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("compiling"));

    ctx.cancel();
    assert_eq!(stream.next_line().await.unwrap(), None);
    assert!(stream.is_cancelled());
    drop(stream);

    client.cancel(&id).await.unwrap();
    eventually("log readers to close", || {
        server.registry.logs().active_readers() == 0
    })
    .await;
}
