use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use forge_core::{AuctionControl, CoreError, MetricsHandle, metrics};
use forge_model::{
    Auction, AuctionKind, AuctionSubject, JobId, Matcher, ResourceKind, RetryPolicy, Signature,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{AuctionError, PubSub, wire};

/// Publisher side of the auction protocol.
///
/// Remembers which `New` auctions are still open, per signature and job, so
/// that cancelling a job can withdraw them. Jobs needing the same resource
/// share a signature but keep separate auctions.
#[derive(Clone)]
pub struct AuctionBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    bus: Arc<dyn PubSub>,
    active: Mutex<ActiveAuctions>,
    withdraw_retry: RetryPolicy,
    metrics: MetricsHandle,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct ActiveAuctions {
    by_signature: HashMap<Signature, HashMap<JobId, Auction>>,
    by_job: HashMap<JobId, HashSet<Signature>>,
}

impl ActiveAuctions {
    /// Replaces an earlier auction of the same job and signature.
    fn insert(&mut self, auction: Auction) {
        let Some(origin) = auction.origin.clone() else {
            return;
        };
        self.by_job
            .entry(origin.job_id.clone())
            .or_default()
            .insert(auction.signature.clone());
        self.by_signature
            .entry(auction.signature.clone())
            .or_default()
            .insert(origin.job_id, auction);
    }

    fn get(&self, signature: &Signature, job: &JobId) -> Option<&Auction> {
        self.by_signature.get(signature)?.get(job)
    }

    fn remove(&mut self, signature: &Signature, job: &JobId) -> Option<Auction> {
        let jobs = self.by_signature.get_mut(signature)?;
        let auction = jobs.remove(job)?;
        if jobs.is_empty() {
            self.by_signature.remove(signature);
        }
        if let Some(sigs) = self.by_job.get_mut(job) {
            sigs.remove(signature);
            if sigs.is_empty() {
                self.by_job.remove(job);
            }
        }
        Some(auction)
    }

    fn remove_signature(&mut self, signature: &Signature) -> usize {
        let jobs: Vec<JobId> = self
            .by_signature
            .get(signature)
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default();
        jobs.iter()
            .filter(|job| self.remove(signature, job).is_some())
            .count()
    }

    fn len(&self) -> usize {
        self.by_signature.values().map(HashMap::len).sum()
    }
}

impl AuctionBroker {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                bus,
                active: Mutex::new(ActiveAuctions::default()),
                withdraw_retry: RetryPolicy::default(),
                metrics: metrics::noop(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Broker with an explicit withdrawal retry policy, metrics backend and shutdown token.
    pub fn with_options(
        bus: Arc<dyn PubSub>,
        withdraw_retry: RetryPolicy,
        metrics: MetricsHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                bus,
                active: Mutex::new(ActiveAuctions::default()),
                withdraw_retry,
                metrics,
                shutdown,
            }),
        }
    }

    /// Publish `auction` on its resource kind's topic.
    ///
    /// A `New` becomes the active auction of its signature before it is
    /// published, so a concurrent [`AuctionBroker::withdraw_job`] always
    /// sees it; a rejected publish forgets it again. A `Cancel` clears the
    /// active auction once published.
    #[instrument(level = "debug", skip(self, auction), fields(signature = %auction.signature, kind = ?auction.kind))]
    pub async fn announce(&self, auction: Auction) -> Result<(), AuctionError> {
        let topic = auction.resource_kind.topic();
        let payload = wire::encode(&auction);

        if auction.is_new() {
            self.active().insert(auction.clone());
        }
        if let Err(e) = self.inner.bus.publish(&topic, payload).await {
            if auction.is_new() {
                self.forget(&auction);
            }
            return Err(e.into());
        }
        self.inner
            .metrics
            .auction_published(auction.kind, auction.resource_kind);

        match auction.kind {
            AuctionKind::New => {
                debug!(%topic, origin = ?auction.origin, "auction announced");
            }
            AuctionKind::Cancel => {
                debug!(%topic, origin = ?auction.origin, "auction withdrawn");
                let mut active = self.active();
                match &auction.origin {
                    Some(origin) => {
                        active.remove(&auction.signature, &origin.job_id);
                    }
                    None => {
                        active.remove_signature(&auction.signature);
                    }
                }
            }
        }
        Ok(())
    }

    /// Publish a `Cancel` for every open auction of `signature`.
    ///
    /// Without an active record the resource kind and origin are unknown, so
    /// the cancel goes out on every topic and matches any origin.
    #[instrument(level = "debug", skip(self), fields(signature = %signature))]
    pub async fn withdraw(&self, signature: &Signature) -> Result<(), AuctionError> {
        let known: Vec<Auction> = self
            .active()
            .by_signature
            .get(signature)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default();
        if !known.is_empty() {
            for auction in known {
                self.announce(auction.withdrawal()).await?;
            }
            return Ok(());
        }

        for resource_kind in ResourceKind::ALL {
            self.announce(Auction {
                kind: AuctionKind::Cancel,
                resource_kind,
                signature: signature.clone(),
                matcher: Matcher::default(),
                subject: AuctionSubject::default(),
                origin: None,
            })
            .await?;
        }
        Ok(())
    }

    /// Publish a `Cancel` for the auction `job` has open on `signature`, if any.
    pub async fn withdraw_for(
        &self,
        signature: &Signature,
        job: &JobId,
    ) -> Result<bool, AuctionError> {
        let Some(auction) = self.active_for(signature, job) else {
            return Ok(false);
        };
        self.announce(auction.withdrawal()).await?;
        Ok(true)
    }

    /// Withdraw every open auction of `job`.
    ///
    /// Withdrawals that fail are retried in the background until they go
    /// through or the broker shuts down; the error still reports them.
    #[instrument(level = "debug", skip(self), fields(job = %job))]
    pub async fn withdraw_job(&self, job: &JobId) -> Result<usize, AuctionError> {
        let open = self.open_for(job);
        let mut withdrawn = 0;
        let mut last_error = None;

        for auction in open {
            match self.announce(auction.withdrawal()).await {
                Ok(()) => withdrawn += 1,
                Err(e) => {
                    warn!(signature = %auction.signature, error = %e, "withdrawal failed, retrying in background");
                    self.spawn_withdraw_retry(auction);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(withdrawn),
        }
    }

    /// Forget the auctions of `job` without publishing anything.
    pub fn settle(&self, job: &JobId) -> usize {
        let mut active = self.active();
        let sigs: Vec<Signature> = active
            .by_job
            .get(job)
            .map(|sigs| sigs.iter().cloned().collect())
            .unwrap_or_default();
        let settled = sigs
            .iter()
            .filter(|sig| active.remove(sig, job).is_some())
            .count();
        if settled > 0 {
            debug!(job = %job, settled, "auctions settled");
        }
        settled
    }

    /// Active `New` auction `job` has open on `signature`.
    pub fn active_for(&self, signature: &Signature, job: &JobId) -> Option<Auction> {
        self.active().get(signature, job).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Drop `auction` from the active set unless a newer attempt replaced it.
    fn forget(&self, auction: &Auction) {
        let Some(origin) = &auction.origin else {
            return;
        };
        let mut active = self.active();
        if active
            .get(&auction.signature, &origin.job_id)
            .is_some_and(|current| current.origin == auction.origin)
        {
            active.remove(&auction.signature, &origin.job_id);
        }
    }

    fn open_for(&self, job: &JobId) -> Vec<Auction> {
        let active = self.active();
        active
            .by_job
            .get(job)
            .map(|sigs| {
                sigs.iter()
                    .filter_map(|s| active.get(s, job).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn spawn_withdraw_retry(&self, auction: Auction) {
        let broker = self.clone();
        let policy = self.inner.withdraw_retry;
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let withdrawal = auction.withdrawal();
            let mut retry = 0u32;
            loop {
                let delay = policy.delay(retry);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        warn!(signature = %auction.signature, "broker shut down before withdrawal went through");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                // A newer attempt of the job replaced the auction we were withdrawing.
                if let Some(origin) = &auction.origin
                    && broker
                        .active_for(&auction.signature, &origin.job_id)
                        .is_some_and(|current| current.origin != auction.origin)
                {
                    return;
                }

                match broker.announce(withdrawal.clone()).await {
                    Ok(()) => {
                        info!(signature = %auction.signature, retries = retry + 1, "withdrawal published after retry");
                        return;
                    }
                    Err(e) => {
                        retry = retry.saturating_add(1);
                        if retry % 10 == 0 {
                            error!(signature = %auction.signature, retries = retry, error = %e, "withdrawal still failing");
                        }
                    }
                }
            }
        });
    }

    fn active(&self) -> MutexGuard<'_, ActiveAuctions> {
        // The maps stay consistent between statements; a panic cannot leave them half-updated.
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuctionControl for AuctionBroker {
    async fn withdraw_job(&self, job: &JobId) -> Result<usize, CoreError> {
        AuctionBroker::withdraw_job(self, job)
            .await
            .map_err(CoreError::from)
    }

    fn settle_job(&self, job: &JobId) {
        self.settle(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBus, TransportError};
    use forge_model::Ticket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn need(job: &str, branch: &str) -> Auction {
        Auction::need(
            ResourceKind::Database,
            AuctionSubject {
                config_id: "cfg".into(),
                application_id: "app".into(),
                project_id: "proj".into(),
                branch: branch.into(),
            },
            Matcher::named("/users"),
            Ticket::new(JobId::from(job), 1),
        )
    }

    /// Fails the first `failures` publishes, then delegates to a memory bus.
    struct FlakyBus {
        bus: MemoryBus,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl PubSub for FlakyBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Rejected {
                    topic: topic.into(),
                    reason: "injected".into(),
                });
            }
            self.bus.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<crate::Subscription, TransportError> {
            self.bus.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn announce_publishes_on_kind_topic() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("forge.auction.database").await.unwrap();
        let broker = AuctionBroker::new(Arc::new(bus));

        let auction = need("job-1", "main");
        broker.announce(auction.clone()).await.unwrap();

        let received = wire::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(received, auction);
        assert_eq!(
            broker.active_for(&auction.signature, &JobId::from("job-1")),
            Some(auction)
        );
    }

    #[tokio::test]
    async fn announce_fails_when_transport_rejects() {
        let bus = MemoryBus::new();
        bus.close();
        let broker = AuctionBroker::new(Arc::new(bus));

        assert!(matches!(
            broker.announce(need("job-1", "main")).await,
            Err(AuctionError::Transport(TransportError::Closed))
        ));
        assert_eq!(broker.active_count(), 0);
    }

    #[tokio::test]
    async fn withdraw_copies_origin_of_active_auction() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("forge.auction.database").await.unwrap();
        let broker = AuctionBroker::new(Arc::new(bus));

        let auction = need("job-1", "main");
        broker.announce(auction.clone()).await.unwrap();
        let _ = sub.recv().await;

        broker.withdraw(&auction.signature).await.unwrap();
        let cancel = wire::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(cancel.kind, AuctionKind::Cancel);
        assert_eq!(cancel.origin, auction.origin);
        assert_eq!(broker.active_count(), 0);
    }

    #[tokio::test]
    async fn withdraw_unknown_signature_goes_to_every_topic() {
        let bus = MemoryBus::new();
        let mut db = bus.subscribe("forge.auction.database").await.unwrap();
        let mut storage = bus.subscribe("forge.auction.storage").await.unwrap();
        let broker = AuctionBroker::new(Arc::new(bus));

        broker.withdraw(&Signature::from("sig")).await.unwrap();
        for sub in [&mut db, &mut storage] {
            let cancel = wire::decode(&sub.recv().await.unwrap()).unwrap();
            assert_eq!(cancel.kind, AuctionKind::Cancel);
            assert_eq!(cancel.origin, None);
        }
    }

    #[tokio::test]
    async fn withdraw_job_only_touches_that_job() {
        let broker = AuctionBroker::new(Arc::new(MemoryBus::new()));
        broker.announce(need("job-1", "main")).await.unwrap();
        broker.announce(need("job-1", "dev")).await.unwrap();
        broker.announce(need("job-2", "feature")).await.unwrap();

        assert_eq!(broker.withdraw_job(&JobId::from("job-1")).await.unwrap(), 2);
        assert_eq!(broker.active_count(), 1);
        assert_eq!(broker.withdraw_job(&JobId::from("job-1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn same_signature_jobs_keep_separate_auctions() {
        let broker = AuctionBroker::new(Arc::new(MemoryBus::new()));
        let first = need("job-1", "main");
        let second = need("job-2", "main");
        assert_eq!(first.signature, second.signature);

        broker.announce(first.clone()).await.unwrap();
        broker.announce(second.clone()).await.unwrap();
        assert_eq!(broker.active_count(), 2);

        assert_eq!(broker.withdraw_job(&JobId::from("job-1")).await.unwrap(), 1);
        assert_eq!(broker.active_count(), 1);
        assert_eq!(
            broker.active_for(&second.signature, &JobId::from("job-2")),
            Some(second)
        );
    }

    #[tokio::test]
    async fn settle_forgets_without_publishing() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("forge.auction.database").await.unwrap();
        let broker = AuctionBroker::new(Arc::new(bus));
        broker.announce(need("job-1", "main")).await.unwrap();
        let _ = sub.recv().await;

        assert_eq!(broker.settle(&JobId::from("job-1")), 1);
        assert_eq!(broker.active_count(), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_withdrawal_is_retried_in_background() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("forge.auction.database").await.unwrap();
        let flaky = Arc::new(FlakyBus {
            bus,
            failures: AtomicUsize::new(0),
        });
        let broker = AuctionBroker::new(flaky.clone());

        let auction = need("job-1", "main");
        broker.announce(auction.clone()).await.unwrap();
        let _ = sub.recv().await;

        flaky.failures.store(2, Ordering::SeqCst);
        assert!(broker.withdraw_job(&JobId::from("job-1")).await.is_err());
        assert!(
            broker
                .active_for(&auction.signature, &JobId::from("job-1"))
                .is_some()
        );

        let cancel = tokio::time::timeout(Duration::from_secs(30), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let cancel = wire::decode(&cancel).unwrap();
        assert_eq!(cancel.kind, AuctionKind::Cancel);
        assert_eq!(broker.active_count(), 0);
    }
}
