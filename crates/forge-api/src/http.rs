use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use forge_auth::{AuthSessionManager, RequestContext};
use forge_model::{JobId, JobQuery, JobStatus};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_util::{io::ReaderStream, sync::DropGuard};
use tracing::{debug, trace};

use crate::{
    JobResponse, ListJobsParams, ListJobsResponse, ProjectJobsResponse, SubmitJobRequest,
    SubmitJobResponse, error::ApiError, handler::ApiHandler,
};

/// Buffer between the log follower and the response body.
const LOG_PIPE_CAPACITY: usize = 16 * 1024;

/// HTTP API service builder.
pub struct HttpApi<H> {
    handler: Arc<H>,
    sessions: Arc<AuthSessionManager>,
}

struct ApiState<H> {
    handler: Arc<H>,
    sessions: Arc<AuthSessionManager>,
}

impl<H> Clone for ApiState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<H> HttpApi<H>
where
    H: ApiHandler,
{
    /// Every route requires a session opened through `sessions`.
    pub fn new(handler: Arc<H>, sessions: Arc<AuthSessionManager>) -> Self {
        Self { handler, sessions }
    }

    /// Build axum router with mounted endpoints.
    ///
    /// Routes:
    /// - GET /jobs/{project_id} - Job ids of a project
    /// - POST /jobs - Submit job
    /// - GET /job/{id} - Get job
    /// - GET /logs/{resource_id} - Follow a log resource
    /// - POST /cancel/{id} - Cancel job
    /// - POST /retry/{id} - Retry job
    /// - GET /api/v1/jobs - List jobs with filters
    pub fn router(self) -> Router {
        let state = ApiState {
            handler: self.handler,
            sessions: self.sessions,
        };

        Router::new()
            .route("/jobs", post(submit_job::<H>))
            .route("/jobs/{project_id}", get(project_jobs::<H>))
            .route("/job/{id}", get(get_job::<H>))
            .route("/logs/{resource_id}", get(stream_log::<H>))
            .route("/cancel/{id}", post(cancel_job::<H>))
            .route("/retry/{id}", post(retry_job::<H>))
            .route("/api/v1/jobs", get(list_jobs::<H>))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                session_middleware::<H>,
            ))
            .with_state(state)
    }
}

/// Opens the request's session and closes it when the handler returns.
///
/// The request context is injected for handlers; streaming bodies keep it
/// after the session is gone.
async fn session_middleware<H>(
    State(state): State<ApiState<H>>,
    mut req: Request,
    next: Next,
) -> Response
where
    H: ApiHandler,
{
    let ctx = RequestContext::new();
    let _scope = state.sessions.scope(&ctx);

    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if let Err(e) = state.sessions.open_header(&ctx, authorization.as_deref()).await {
        debug!(request = %ctx.id(), error = %e, "request rejected");
        return ApiError::from(e).into_response();
    }

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// POST /jobs
async fn submit_job<H>(
    State(state): State<ApiState<H>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    debug!(project = %req.meta.project_id, branch = %req.meta.branch, "submitting job");
    let job_id = state.handler.submit_job(req.meta).await?;

    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

/// GET /jobs/{project_id}
async fn project_jobs<H>(
    State(state): State<ApiState<H>>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let job_ids = state.handler.project_jobs(&project_id).await?;
    Ok(Json(ProjectJobsResponse {
        project_id,
        job_ids,
    }))
}

/// GET /job/{id}
async fn get_job<H>(
    State(state): State<ApiState<H>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let job = state.handler.get_job(&JobId::from(id)).await?;
    Ok(Json(JobResponse { job }))
}

/// POST /cancel/{id}
async fn cancel_job<H>(
    State(state): State<ApiState<H>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let job_id = JobId::from(id);
    let login = ctx.identity().map(|i| i.login).unwrap_or_default();
    let job = state.handler.cancel_job(&job_id).await?;
    debug!(%job_id, %login, "job cancel requested");

    Ok(Json(JobResponse { job }))
}

/// POST /retry/{id}
async fn retry_job<H>(
    State(state): State<ApiState<H>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let job_id = JobId::from(id);
    let login = ctx.identity().map(|i| i.login).unwrap_or_default();
    let job = state.handler.retry_job(&job_id).await?;
    debug!(%job_id, %login, attempt = job.attempt, "job retry requested");

    Ok(Json(JobResponse { job }))
}

/// GET /api/v1/jobs
///
/// Query params (all optional, combinable):
/// - ?project=id     - filter by project
/// - ?status=running - filter by status
/// - ?limit=50       - max items per page (default 100, max 1000)
/// - ?offset=0       - pagination offset (default 0)
async fn list_jobs<H>(
    State(state): State<ApiState<H>>,
    Query(params): Query<ListJobsParams>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let mut query = JobQuery::new();

    if let Some(project) = params.project {
        if project.trim().is_empty() {
            return Err(ApiError::InvalidRequest("project cannot be empty".into()));
        }
        query = query.with_project(project);
    }
    if let Some(status) = params.status {
        let status: JobStatus = status
            .parse()
            .map_err(|e| ApiError::InvalidRequest(format!("{e}")))?;
        query = query.with_status(status);
    }
    if let Some(limit) = params.limit {
        if limit == 0 {
            return Err(ApiError::InvalidRequest("limit must be positive".into()));
        }
        query = query.with_limit(limit);
    }
    if let Some(offset) = params.offset {
        query = query.with_offset(offset);
    }

    let page = state.handler.list_jobs(query).await?;
    Ok(Json(ListJobsResponse {
        jobs: page.items,
        total: page.total,
    }))
}

/// GET /logs/{resource_id}
///
/// Streams lines as they are appended until the attempt finishes or the
/// client goes away.
async fn stream_log<H>(
    State(state): State<ApiState<H>>,
    Extension(ctx): Extension<RequestContext>,
    Path(resource_id): Path<String>,
) -> Result<Response, ApiError>
where
    H: ApiHandler,
{
    let stream_ctx = ctx.token().child_token();
    let mut reader = state.handler.open_log(&resource_id, stream_ctx.clone())?;
    let (mut tx, rx) = tokio::io::duplex(LOG_PIPE_CAPACITY);

    tokio::spawn(async move {
        while let Some(line) = reader.next_line().await {
            if tx.write_all(line.as_bytes()).await.is_err() || tx.write_all(b"\n").await.is_err() {
                break;
            }
        }
        trace!(resource = %resource_id, lines = reader.position(), "log stream finished");
    });

    let body = Body::from_stream(ReaderStream::new(BodyPipe {
        inner: rx,
        _stop_reader: stream_ctx.drop_guard(),
    }));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

/// Read side of the log pipe; dropping it stops the follower.
struct BodyPipe {
    inner: DuplexStream,
    _stop_reader: DropGuard,
}

impl AsyncRead for BodyPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
