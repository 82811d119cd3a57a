use std::{sync::Arc, time::Duration};

use forge_auction::{Dispatcher, ResourceNeed};
use forge_core::JobRegistry;
use forge_model::{AuctionSubject, Job, JobQuery, JobStatus, Matcher, ResourceKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Moves queued jobs onto the auction bus.
pub struct QueuePump {
    registry: Arc<JobRegistry>,
    dispatcher: Dispatcher,
    interval: Duration,
}

impl QueuePump {
    pub fn new(registry: Arc<JobRegistry>, dispatcher: Dispatcher, interval: Duration) -> Self {
        Self {
            registry,
            dispatcher,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.pump_once().await;
                }
            }
        }
        debug!("queue pump stopped");
    }

    /// Dispatch every job queued right now. Returns how many were dispatched.
    pub async fn pump_once(&self) -> usize {
        let query = JobQuery::new().with_status(JobStatus::Queued);
        let page = match self.registry.query(&query).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "failed to list queued jobs");
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in page.items {
            match self.dispatcher.dispatch(&job.id, need_for(&job)).await {
                Ok(_) => dispatched += 1,
                Err(e) => warn!(job = %job.id, error = %e, "dispatch failed"),
            }
        }
        dispatched
    }
}

/// The database a job's push needs to build against.
pub fn need_for(job: &Job) -> ResourceNeed {
    ResourceNeed {
        resource_kind: ResourceKind::Database,
        subject: AuctionSubject {
            config_id: job.meta.head_commit.clone(),
            application_id: job.meta.repository_id.clone(),
            project_id: job.meta.project_id.clone(),
            branch: job.meta.branch.clone(),
        },
        matcher: Matcher::named(format!("/{}", job.meta.repository_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_auction::{AuctionBroker, MemoryBus, PubSub};
    use forge_core::MemoryJobStore;
    use forge_model::JobMeta;

    #[tokio::test]
    async fn dispatches_queued_jobs_once() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe(&ResourceKind::Database.topic()).await.unwrap();
        let registry = Arc::new(JobRegistry::new(Arc::new(MemoryJobStore::new())));
        let pump = QueuePump::new(
            registry.clone(),
            Dispatcher::new(registry.clone(), AuctionBroker::new(bus.clone())),
            Duration::from_millis(10),
        );

        let id = registry
            .submit(JobMeta {
                project_id: "proj".into(),
                repository_id: "42".into(),
                repository: "acme/site".into(),
                provider: "github".into(),
                branch: "main".into(),
                head_commit: "c0ffee".into(),
            })
            .await
            .unwrap();

        assert_eq!(pump.pump_once().await, 1);
        assert_eq!(registry.get(&id).await.unwrap().status, JobStatus::Running);
        assert!(sub.recv().await.is_some());

        assert_eq!(pump.pump_once().await, 0);
    }
}
