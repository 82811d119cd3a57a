use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use forge_model::{
    Attempt, Job, JobId, JobMeta, JobPage, JobQuery, JobStatus, LogRef, StatusUpdate,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    AuctionControl, CoreError, JobStore, KeyedLocks, LogBook, LogReader,
    metrics::{self, MetricsHandle},
};

/// Owner of job records and their state machine.
///
/// Mutations of one job id are serialized through a per-job lock; reads go
/// straight to the store and see whole committed records.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    locks: KeyedLocks<JobId>,
    logs: LogBook,
    /// Execution context of each job's current attempt.
    contexts: Mutex<HashMap<JobId, CancellationToken>>,
    auctions: Option<Arc<dyn AuctionControl>>,
    metrics: MetricsHandle,
    root: CancellationToken,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            logs: LogBook::new(),
            contexts: Mutex::new(HashMap::new()),
            auctions: None,
            metrics: metrics::noop(),
            root: CancellationToken::new(),
        }
    }

    /// Withdraw auctions through `control` when jobs are cancelled.
    pub fn with_auction_control(mut self, control: Arc<dyn AuctionControl>) -> Self {
        self.auctions = Some(control);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Parent of every attempt context; cancelling it cancels all of them.
    pub fn with_root(mut self, root: CancellationToken) -> Self {
        self.root = root;
        self
    }

    #[instrument(level = "debug", skip(self, meta), fields(project = %meta.project_id, branch = %meta.branch))]
    pub async fn submit(&self, meta: JobMeta) -> Result<JobId, CoreError> {
        let id = JobId::from(Uuid::new_v4().to_string());
        self.store.insert(Job::queued(id.clone(), meta)).await?;
        self.set_context(&id, self.root.child_token());

        info!(job = %id, "job submitted");
        Ok(id)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, CoreError> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound(id.clone()))
    }

    pub async fn list_by_project(&self, project: &str) -> Result<Vec<JobId>, CoreError> {
        self.store.list_by_project(project).await
    }

    pub async fn query(&self, q: &JobQuery) -> Result<JobPage<Job>, CoreError> {
        self.store.query(q).await
    }

    /// Append one line to a log resource of the job's current attempt.
    #[instrument(level = "trace", skip(self, line), fields(job = %id, resource))]
    pub async fn append_log(
        &self,
        id: &JobId,
        resource: &str,
        line: impl Into<String>,
    ) -> Result<(), CoreError> {
        if resource.trim().is_empty() {
            return Err(CoreError::InvalidRequest("log resource id is empty".into()));
        }

        let _guard = self.locks.lock(id).await;
        let mut job = self.get(id).await?;

        if job.status.is_terminal() {
            return Err(CoreError::InvalidState {
                id: id.clone(),
                status: job.status,
                reason: "logs are closed once an attempt is terminal",
            });
        }
        if let Some((owner, attempt)) = self.logs.owner(resource)
            && (&owner != id || attempt != job.attempt)
        {
            return Err(CoreError::InvalidState {
                id: id.clone(),
                status: job.status,
                reason: "log resource belongs to another attempt",
            });
        }

        let lines = self.logs.len(resource) as u64 + 1;
        job.logs.insert(
            resource.to_string(),
            LogRef {
                attempt: job.attempt,
                lines,
            },
        );
        job.updated_at = SystemTime::now();
        let attempt = job.attempt;
        self.store.save(job).await?;

        self.logs.append(id, attempt, resource, line.into())?;
        Ok(())
    }

    /// Move the given attempt to `status`.
    pub async fn set_status(
        &self,
        id: &JobId,
        attempt: Attempt,
        status: JobStatus,
    ) -> Result<Job, CoreError> {
        self.report(id, attempt, StatusUpdate::to(status)).await
    }

    /// Move the given attempt along the state machine, recording outcome data.
    ///
    /// Reports for a superseded attempt are rejected with `StaleAttempt` and
    /// leave the record untouched. Reporting `Cancelled` withdraws the job's
    /// open auctions exactly like [`JobRegistry::cancel`].
    #[instrument(level = "debug", skip(self, update), fields(job = %id, attempt, to = %update.status))]
    pub async fn report(
        &self,
        id: &JobId,
        attempt: Attempt,
        update: StatusUpdate,
    ) -> Result<Job, CoreError> {
        let job = {
            let _guard = self.locks.lock(id).await;
            let mut job = self.get(id).await?;

            self.check_attempt(&job, attempt)?;
            let from = job.status;
            if !from.can_transition_to(update.status) {
                warn!(job = %id, %from, to = %update.status, "invalid status transition rejected");
                return Err(CoreError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to: update.status,
                });
            }

            job.status = update.status;
            match update.status {
                JobStatus::Successful => job.assets = update.assets,
                JobStatus::Failed => job.error = update.error,
                _ => {}
            }
            job.updated_at = SystemTime::now();
            self.store.save(job.clone()).await?;
            self.metrics.job_transition(from, job.status);

            if job.status.is_terminal() {
                self.finish_attempt(&job);
                if let Some(auctions) = &self.auctions
                    && job.status != JobStatus::Cancelled
                {
                    auctions.settle_job(id);
                }
            }

            info!(job = %id, attempt, %from, to = %job.status, "job status changed");
            job
        };

        if job.status == JobStatus::Cancelled {
            self.withdraw_auctions(id).await;
        }
        Ok(job)
    }

    /// Mark the attempt as running. Repeated calls for a running attempt are no-ops.
    #[instrument(level = "debug", skip(self), fields(job = %id, attempt))]
    pub async fn start(&self, id: &JobId, attempt: Attempt) -> Result<Job, CoreError> {
        let _guard = self.locks.lock(id).await;
        let mut job = self.get(id).await?;

        self.check_attempt(&job, attempt)?;
        match job.status {
            JobStatus::Running => Ok(job),
            JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.updated_at = SystemTime::now();
                self.store.save(job.clone()).await?;
                self.metrics
                    .job_transition(JobStatus::Queued, JobStatus::Running);
                info!(job = %id, attempt, "job running");
                Ok(job)
            }
            from => {
                warn!(job = %id, %from, "cannot start job");
                Err(CoreError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to: JobStatus::Running,
                })
            }
        }
    }

    /// Cancel a queued or running job and withdraw its open auctions.
    ///
    /// Cancelling a job that already finished succeeds without changing it.
    #[instrument(level = "debug", skip(self), fields(job = %id))]
    pub async fn cancel(&self, id: &JobId) -> Result<Job, CoreError> {
        let job = {
            let _guard = self.locks.lock(id).await;
            let mut job = self.get(id).await?;

            if job.status.is_terminal() {
                debug!(job = %id, status = %job.status, "cancel on finished job ignored");
                return Ok(job);
            }

            let from = job.status;
            job.status = JobStatus::Cancelled;
            job.updated_at = SystemTime::now();
            self.store.save(job.clone()).await?;
            self.metrics.job_transition(from, JobStatus::Cancelled);
            self.finish_attempt(&job);

            info!(job = %id, attempt = job.attempt, %from, "job cancelled");
            job
        };

        self.withdraw_auctions(id).await;
        Ok(job)
    }

    /// Re-queue a failed or cancelled job as a new attempt.
    ///
    /// Logs of earlier attempts stay addressable by their resource ids.
    #[instrument(level = "debug", skip(self), fields(job = %id))]
    pub async fn retry(&self, id: &JobId) -> Result<Job, CoreError> {
        let _guard = self.locks.lock(id).await;
        let mut job = self.get(id).await?;

        if !job.status.is_retryable() {
            return Err(CoreError::InvalidState {
                id: id.clone(),
                status: job.status,
                reason: "only failed or cancelled jobs can be retried",
            });
        }

        job.attempt += 1;
        job.retry_count += 1;
        job.status = JobStatus::Queued;
        job.error = None;
        job.updated_at = SystemTime::now();
        self.store.save(job.clone()).await?;
        self.set_context(id, self.root.child_token());
        self.metrics.job_retried();

        info!(job = %id, attempt = job.attempt, retries = job.retry_count, "job re-queued");
        Ok(job)
    }

    /// Execution context of the job's current attempt.
    ///
    /// It is cancelled when the attempt is cancelled or finishes.
    pub fn context(&self, id: &JobId) -> Result<CancellationToken, CoreError> {
        let contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        contexts
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::JobNotFound(id.clone()))
    }

    /// Cancel the job once `owner` is cancelled.
    ///
    /// The watcher ends on its own when the current attempt finishes first.
    pub fn cancel_when(
        self: &Arc<Self>,
        id: &JobId,
        owner: CancellationToken,
    ) -> Result<JoinHandle<()>, CoreError> {
        let attempt_ctx = self.context(id)?;
        let registry = Arc::clone(self);
        let id = id.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = owner.cancelled() => {
                    if let Err(e) = registry.cancel(&id).await {
                        warn!(job = %id, error = %e, "cancel on owner shutdown failed");
                    }
                }
                _ = attempt_ctx.cancelled() => {}
            }
        }))
    }

    /// Follow a log resource until it closes or `ctx` is cancelled.
    pub fn open_log(&self, resource: &str, ctx: CancellationToken) -> Result<LogReader, CoreError> {
        self.logs.open(resource, ctx)
    }

    /// Every line written to a log resource so far.
    pub fn read_log(&self, resource: &str) -> Result<Vec<String>, CoreError> {
        self.logs.read_all(resource)
    }

    pub fn logs(&self) -> &LogBook {
        &self.logs
    }

    async fn withdraw_auctions(&self, id: &JobId) {
        if let Some(auctions) = &self.auctions {
            match auctions.withdraw_job(id).await {
                Ok(0) => {}
                Ok(withdrawn) => debug!(job = %id, withdrawn, "auctions withdrawn"),
                Err(e) => warn!(job = %id, error = %e, "failed to withdraw auctions"),
            }
        }
    }

    fn check_attempt(&self, job: &Job, attempt: Attempt) -> Result<(), CoreError> {
        if attempt == job.attempt {
            return Ok(());
        }
        self.metrics.stale_report();
        warn!(job = %job.id, reported = attempt, current = job.attempt, "stale attempt report discarded");
        Err(CoreError::StaleAttempt {
            id: job.id.clone(),
            reported: attempt,
            current: job.attempt,
        })
    }

    fn finish_attempt(&self, job: &Job) {
        self.logs.close_attempt(&job.id, job.attempt);
        if let Ok(ctx) = self.context(&job.id) {
            ctx.cancel();
        }
    }

    fn set_context(&self, id: &JobId, ctx: CancellationToken) {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = contexts.insert(id.clone(), ctx) {
            previous.cancel();
        }
    }
}
