use std::sync::Arc;

use forge_core::JobRegistry;
use forge_model::{
    Auction, AuctionSubject, JobId, JobStatus, Matcher, ResourceKind, StatusUpdate, Ticket,
};
use tracing::{error, info, instrument, warn};

use crate::{AuctionBroker, AuctionError};

/// A backend resource one job attempt cannot run without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNeed {
    pub resource_kind: ResourceKind,
    pub subject: AuctionSubject,
    pub matcher: Matcher,
}

/// Execution step that puts a queued job's resource need up for auction.
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    broker: AuctionBroker,
}

impl Dispatcher {
    pub fn new(registry: Arc<JobRegistry>, broker: AuctionBroker) -> Self {
        Self { registry, broker }
    }

    /// Announce `need` for the job's current attempt and mark it running.
    ///
    /// A rejected publish fails the attempt. If the attempt was cancelled or
    /// superseded while the auction went out, the auction is withdrawn again.
    #[instrument(level = "debug", skip(self, need), fields(job = %id, resource = %need.resource_kind))]
    pub async fn dispatch(&self, id: &JobId, need: ResourceNeed) -> Result<Auction, AuctionError> {
        let job = self.registry.get(id).await?;
        if !job.status.is_active() {
            return Err(AuctionError::InvalidAuction(format!(
                "job {id} is {}, nothing to dispatch",
                job.status
            )));
        }

        let ticket = Ticket::new(job.id.clone(), job.attempt);
        let auction = Auction::need(need.resource_kind, need.subject, need.matcher, ticket);

        if job.status == JobStatus::Queued {
            self.registry.start(id, job.attempt).await?;
        }

        if let Err(e) = self.broker.announce(auction.clone()).await {
            error!(job = %id, attempt = job.attempt, error = %e, "auction publish rejected, failing job");
            self.registry
                .report(
                    id,
                    job.attempt,
                    StatusUpdate::failed(format!("auction publish rejected: {e}")),
                )
                .await?;
            return Err(e);
        }

        let current = self.registry.get(id).await?;
        if !current.status.is_active() || current.attempt != job.attempt {
            warn!(job = %id, attempt = job.attempt, status = %current.status, "attempt ended during dispatch, withdrawing auction");
            self.broker.withdraw_for(&auction.signature, id).await?;
            return Err(AuctionError::InvalidAuction(format!(
                "job {id} became {} during dispatch",
                current.status
            )));
        }

        info!(job = %id, attempt = job.attempt, signature = %auction.signature, "resource need announced");
        Ok(auction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBus, PubSub, Subscription, TransportError, wire};
    use async_trait::async_trait;
    use forge_core::MemoryJobStore;
    use forge_model::JobMeta;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn meta() -> JobMeta {
        JobMeta {
            project_id: "proj".into(),
            repository_id: "1".into(),
            repository: "acme/site".into(),
            provider: "github".into(),
            branch: "main".into(),
            head_commit: "abc".into(),
        }
    }

    fn need() -> ResourceNeed {
        ResourceNeed {
            resource_kind: ResourceKind::Database,
            subject: AuctionSubject {
                config_id: "cfg".into(),
                application_id: "app".into(),
                project_id: "proj".into(),
                branch: "main".into(),
            },
            matcher: Matcher::named("/users"),
        }
    }

    #[tokio::test]
    async fn dispatch_runs_job_and_announces() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("forge.auction.database").await.unwrap();
        let registry = Arc::new(JobRegistry::new(Arc::new(MemoryJobStore::new())));
        let dispatcher = Dispatcher::new(registry.clone(), AuctionBroker::new(Arc::new(bus)));

        let id = registry.submit(meta()).await.unwrap();
        let auction = dispatcher.dispatch(&id, need()).await.unwrap();

        assert_eq!(registry.get(&id).await.unwrap().status, JobStatus::Running);
        assert_eq!(auction.origin, Some(Ticket::new(id, 1)));
        assert_eq!(wire::decode(&sub.recv().await.unwrap()).unwrap(), auction);
    }

    #[tokio::test]
    async fn rejected_publish_fails_job() {
        let bus = MemoryBus::new();
        bus.close();
        let registry = Arc::new(JobRegistry::new(Arc::new(MemoryJobStore::new())));
        let dispatcher = Dispatcher::new(registry.clone(), AuctionBroker::new(Arc::new(bus)));

        let id = registry.submit(meta()).await.unwrap();
        assert!(dispatcher.dispatch(&id, need()).await.is_err());

        let job = registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap_or_default().contains("publish rejected"));
    }

    /// Holds the first publish until released.
    struct HeldBus {
        bus: MemoryBus,
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PubSub for HeldBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            if self.hold.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.bus.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
            self.bus.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn cancel_during_publish_withdraws_auction() {
        let held = Arc::new(HeldBus {
            bus: MemoryBus::new(),
            hold: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let mut sub = held.subscribe("forge.auction.database").await.unwrap();
        let broker = AuctionBroker::new(held.clone());
        let registry = Arc::new(
            JobRegistry::new(Arc::new(MemoryJobStore::new()))
                .with_auction_control(Arc::new(broker.clone())),
        );
        let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
        let id = registry.submit(meta()).await.unwrap();

        let dispatching = {
            let id = id.clone();
            tokio::spawn(async move { dispatcher.dispatch(&id, need()).await })
        };
        held.entered.notified().await;
        registry.cancel(&id).await.unwrap();
        held.release.notify_one();

        assert!(dispatching.await.unwrap().is_err());
        assert_eq!(registry.get(&id).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(broker.active_count(), 0);

        let mut kinds = Vec::new();
        while let Some(payload) = sub.try_recv() {
            let auction = wire::decode(&payload).unwrap();
            assert_eq!(auction.origin, Some(Ticket::new(id.clone(), 1)));
            kinds.push(auction.kind);
        }
        assert!(kinds.contains(&forge_model::AuctionKind::New));
        assert!(kinds.contains(&forge_model::AuctionKind::Cancel));
    }

    #[tokio::test]
    async fn finished_job_is_not_dispatched() {
        let registry = Arc::new(JobRegistry::new(Arc::new(MemoryJobStore::new())));
        let dispatcher =
            Dispatcher::new(registry.clone(), AuctionBroker::new(Arc::new(MemoryBus::new())));

        let id = registry.submit(meta()).await.unwrap();
        registry.cancel(&id).await.unwrap();
        assert!(matches!(
            dispatcher.dispatch(&id, need()).await,
            Err(AuctionError::InvalidAuction(_))
        ));
    }
}
