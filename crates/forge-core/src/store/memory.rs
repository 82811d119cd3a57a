use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use forge_model::{Job, JobId, JobPage, JobQuery, ProjectId};

use crate::{CoreError, store::JobStore};

/// In-memory job storage.
#[derive(Clone)]
pub struct MemoryJobStore {
    inner: Arc<RwLock<MemoryJobStoreInner>>,
}

struct MemoryJobStoreInner {
    /// Jobs indexed by JobId.
    jobs: HashMap<JobId, Job>,
    /// Every job id in submission order.
    order: Vec<JobId>,
    /// Index: project -> job ids in submission order.
    by_project: HashMap<ProjectId, Vec<JobId>>,
}

impl MemoryJobStore {
    /// Create empty job storage.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryJobStoreInner {
                jobs: HashMap::new(),
                order: Vec::new(),
                by_project: HashMap::new(),
            })),
        }
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryJobStoreInner>, CoreError> {
        self.inner
            .read()
            .map_err(|_| CoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryJobStoreInner>, CoreError> {
        self.inner
            .write()
            .map_err(|_| CoreError::Storage("job store lock poisoned".into()))
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), CoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(CoreError::Storage(format!("job id {} already exists", job.id)));
        }

        let id = job.id.clone();
        inner
            .by_project
            .entry(job.meta.project_id.clone())
            .or_default()
            .push(id.clone());
        inner.order.push(id.clone());
        inner.jobs.insert(id, job);
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, CoreError> {
        let inner = self.read()?;
        Ok(inner.jobs.get(id).cloned())
    }

    async fn save(&self, job: Job) -> Result<(), CoreError> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job;
                Ok(())
            }
            None => Err(CoreError::JobNotFound(job.id)),
        }
    }

    async fn list_by_project(&self, project: &str) -> Result<Vec<JobId>, CoreError> {
        let inner = self.read()?;
        Ok(inner.by_project.get(project).cloned().unwrap_or_default())
    }

    /// Filters are applied inside a single read lock.
    /// When `project` is specified, uses the `by_project` index to narrow the scan.
    /// `total` reflects the count after filtering, before pagination.
    async fn query(&self, q: &JobQuery) -> Result<JobPage<Job>, CoreError> {
        let inner = self.read()?;

        let ids: &[JobId] = match &q.project {
            Some(project) => match inner.by_project.get(project.as_str()) {
                Some(ids) => ids,
                None => {
                    return Ok(JobPage {
                        items: vec![],
                        total: 0,
                    });
                }
            },
            None => &inner.order,
        };

        let filtered: Vec<&Job> = ids
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| q.status.is_none_or(|status| job.status == status))
            .collect();
        let total = filtered.len();

        let items = filtered
            .into_iter()
            .skip(q.offset)
            .take(q.limit)
            .cloned()
            .collect();

        Ok(JobPage { items, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_model::{JobMeta, JobStatus};

    fn job(id: &str, project: &str) -> Job {
        Job::queued(
            JobId::from(id),
            JobMeta {
                project_id: project.into(),
                repository_id: "1".into(),
                repository: String::new(),
                provider: "github".into(),
                branch: "main".into(),
                head_commit: "abc".into(),
            },
        )
    }

    async fn setup_query_store() -> MemoryJobStore {
        let store = MemoryJobStore::new();
        // proj-a: 3 jobs (2 running, 1 queued)
        for id in ["a1", "a2", "a3"] {
            store.insert(job(id, "proj-a")).await.unwrap();
        }
        for id in ["a1", "a2"] {
            let mut j = store.load(&JobId::from(id)).await.unwrap().unwrap();
            j.status = JobStatus::Running;
            store.save(j).await.unwrap();
        }

        // proj-b: 2 jobs (1 failed, 1 queued)
        store.insert(job("b1", "proj-b")).await.unwrap();
        store.insert(job("b2", "proj-b")).await.unwrap();
        let mut b1 = store.load(&JobId::from("b1")).await.unwrap().unwrap();
        b1.status = JobStatus::Failed;
        store.save(b1).await.unwrap();

        store
    }

    #[tokio::test]
    async fn insert_and_load() {
        let store = MemoryJobStore::new();
        store.insert(job("j1", "p")).await.unwrap();

        let loaded = store.load(&JobId::from("j1")).await.unwrap().unwrap();
        assert_eq!(loaded.id, JobId::from("j1"));
        assert_eq!(loaded.status, JobStatus::Queued);
        assert!(store.load(&JobId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryJobStore::new();
        store.insert(job("j1", "p")).await.unwrap();
        assert!(matches!(
            store.insert(job("j1", "p")).await,
            Err(CoreError::Storage(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn save_unknown_job_fails() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.save(job("ghost", "p")).await,
            Err(CoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_by_project_keeps_submission_order() {
        let store = MemoryJobStore::new();
        for id in ["j3", "j1", "j2"] {
            store.insert(job(id, "p")).await.unwrap();
        }
        store.insert(job("other", "q")).await.unwrap();

        let ids = store.list_by_project("p").await.unwrap();
        assert_eq!(
            ids,
            vec![JobId::from("j3"), JobId::from("j1"), JobId::from("j2")]
        );
        assert!(store.list_by_project("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_no_filters_returns_all() {
        let store = setup_query_store().await;
        let page = store.query(&JobQuery::new().with_limit(100)).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.items[0].id, JobId::from("a1"));
    }

    #[tokio::test]
    async fn query_by_project_and_status() {
        let store = setup_query_store().await;
        let page = store
            .query(
                &JobQuery::new()
                    .with_project("proj-a")
                    .with_status(JobStatus::Running),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|j| j.status == JobStatus::Running));
    }

    #[tokio::test]
    async fn query_unknown_project_returns_empty() {
        let store = setup_query_store().await;
        let page = store
            .query(&JobQuery::new().with_project("nonexistent"))
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn query_pagination_offset_and_limit() {
        let store = setup_query_store().await;
        // 5 total jobs, offset 2 limit 2 => items 2, total 5
        let page = store
            .query(&JobQuery::new().with_limit(2).with_offset(2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, JobId::from("a3"));
    }

    #[tokio::test]
    async fn query_offset_beyond_total() {
        let store = setup_query_store().await;
        let page = store
            .query(&JobQuery::new().with_offset(100))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(page.items.is_empty());
    }
}
