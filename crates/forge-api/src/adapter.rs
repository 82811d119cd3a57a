use std::sync::Arc;

use async_trait::async_trait;
use forge_core::{JobRegistry, LogReader};
use forge_model::{Job, JobId, JobMeta, JobPage, JobQuery};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::handler::ApiHandler;

/// Adapter that bridges `JobRegistry` to `ApiHandler`.
pub struct RegistryAdapter {
    registry: Arc<JobRegistry>,
}

impl RegistryAdapter {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ApiHandler for RegistryAdapter {
    async fn submit_job(&self, meta: JobMeta) -> Result<JobId, ApiError> {
        if let Some(field) = meta.missing_field() {
            return Err(ApiError::InvalidRequest(format!("meta.{field} is required")));
        }
        Ok(self.registry.submit(meta).await?)
    }

    async fn project_jobs(&self, project: &str) -> Result<Vec<JobId>, ApiError> {
        Ok(self.registry.list_by_project(project).await?)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, ApiError> {
        Ok(self.registry.get(id).await?)
    }

    async fn list_jobs(&self, query: JobQuery) -> Result<JobPage<Job>, ApiError> {
        Ok(self.registry.query(&query).await?)
    }

    async fn cancel_job(&self, id: &JobId) -> Result<Job, ApiError> {
        Ok(self.registry.cancel(id).await?)
    }

    async fn retry_job(&self, id: &JobId) -> Result<Job, ApiError> {
        Ok(self.registry.retry(id).await?)
    }

    fn open_log(&self, resource: &str, ctx: CancellationToken) -> Result<LogReader, ApiError> {
        Ok(self.registry.open_log(resource, ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::MemoryJobStore;

    #[tokio::test]
    async fn submit_rejects_incomplete_meta() {
        let adapter = RegistryAdapter::new(Arc::new(JobRegistry::new(Arc::new(
            MemoryJobStore::new(),
        ))));
        let meta = JobMeta {
            project_id: "proj".into(),
            repository_id: "1".into(),
            repository: String::new(),
            provider: "github".into(),
            branch: " ".into(),
            head_commit: "abc".into(),
        };

        let err = adapter.submit_job(meta).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(ref m) if m.contains("branch")));
        assert!(adapter.project_jobs("proj").await.unwrap().is_empty());
    }
}
