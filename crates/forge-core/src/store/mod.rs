mod memory;
pub use memory::MemoryJobStore;

use async_trait::async_trait;
use forge_model::{Job, JobId, JobPage, JobQuery};

use crate::CoreError;

/// Durable home of job records.
///
/// Implementations only need per-call atomicity: the registry serializes
/// writers of one job id itself, so `load` followed by `save` never races
/// with another writer of the same job.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Store a new job. Fails if the id is already taken.
    async fn insert(&self, job: Job) -> Result<(), CoreError>;

    /// Snapshot of a job, `None` if unknown.
    async fn load(&self, id: &JobId) -> Result<Option<Job>, CoreError>;

    /// Replace an existing job record.
    async fn save(&self, job: Job) -> Result<(), CoreError>;

    /// Job ids of a project in submission order.
    async fn list_by_project(&self, project: &str) -> Result<Vec<JobId>, CoreError>;

    /// Filtered, paginated listing in submission order.
    async fn query(&self, q: &JobQuery) -> Result<JobPage<Job>, CoreError>;
}
