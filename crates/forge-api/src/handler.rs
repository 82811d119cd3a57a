use async_trait::async_trait;
use forge_core::LogReader;
use forge_model::{Job, JobId, JobMeta, JobPage, JobQuery};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

/// Job API handler.
///
/// Abstracts the backend so the HTTP layer can sit on the provided
/// `RegistryAdapter` or on a custom handler with extra policy.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    /// Submit a new job for a repository event.
    async fn submit_job(&self, meta: JobMeta) -> Result<JobId, ApiError>;

    /// Ids of every job of a project, oldest first.
    async fn project_jobs(&self, project: &str) -> Result<Vec<JobId>, ApiError>;

    async fn get_job(&self, id: &JobId) -> Result<Job, ApiError>;

    /// Filtered, paginated job listing.
    async fn list_jobs(&self, query: JobQuery) -> Result<JobPage<Job>, ApiError>;

    async fn cancel_job(&self, id: &JobId) -> Result<Job, ApiError>;

    async fn retry_job(&self, id: &JobId) -> Result<Job, ApiError>;

    /// Follow a log resource; the reader stops once `ctx` is cancelled.
    fn open_log(&self, resource: &str, ctx: CancellationToken) -> Result<LogReader, ApiError>;
}
