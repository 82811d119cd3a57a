use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use forge_core::{CoreError, JobRegistry, MetricsHandle, metrics};
use forge_model::{Auction, AuctionKind, ResourceKind, Signature, StatusUpdate, Ticket, WorkerProfile};
use tokio::{sync::Notify, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{ClaimConfig, ClaimOutcome, ClaimStore, NegativeCache};
use crate::{AuctionError, ClaimError, PubSub, Subscription, wire};

/// Provisions the resource an auction asks for.
#[async_trait]
pub trait Fulfiller: Send + Sync + 'static {
    /// Returns the produced assets (name to content address).
    ///
    /// Must stop promptly once `ctx` is cancelled.
    async fn fulfill(
        &self,
        auction: &Auction,
        ctx: CancellationToken,
    ) -> Result<BTreeMap<String, String>, AuctionError>;
}

/// Where a winning worker reports the job attempt it works for.
#[async_trait]
pub trait CompletionReporter: Send + Sync + 'static {
    async fn start(&self, ticket: &Ticket) -> Result<(), CoreError>;

    async fn complete(&self, ticket: &Ticket, update: StatusUpdate) -> Result<(), CoreError>;
}

/// Reports straight into an in-process registry.
pub struct RegistryReporter {
    registry: Arc<JobRegistry>,
}

impl RegistryReporter {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CompletionReporter for RegistryReporter {
    async fn start(&self, ticket: &Ticket) -> Result<(), CoreError> {
        self.registry
            .start(&ticket.job_id, ticket.attempt)
            .await
            .map(|_| ())
    }

    async fn complete(&self, ticket: &Ticket, update: StatusUpdate) -> Result<(), CoreError> {
        self.registry
            .report(&ticket.job_id, ticket.attempt, update)
            .await
            .map(|_| ())
    }
}

/// What a worker did with one delivered auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Claimed, fulfilled and reported successful.
    Won,
    /// The job was failed: fulfillment kept failing, the hold was lost, or
    /// another job held the resource for too long.
    Failed,
    /// Stopped by a cancel or shutdown, or handed over to another worker.
    Aborted,
    /// Another worker holds the claim for this need.
    Conflict,
    /// This need was already claimed by us or fulfilled.
    Duplicate,
    /// The matcher does not admit this worker.
    Ineligible,
    /// A remembered cancel covers this need.
    Suppressed,
    /// A cancel was recorded; `aborted` if it stopped work in progress.
    Withdrawn { aborted: bool },
    /// The claim store stayed unavailable; the job was failed.
    Unavailable,
    /// The payload could not be decoded.
    Malformed,
}

impl Handled {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handled::Won => "won",
            Handled::Failed => "failed",
            Handled::Aborted => "aborted",
            Handled::Conflict => "conflict",
            Handled::Duplicate => "duplicate",
            Handled::Ineligible => "ineligible",
            Handled::Suppressed => "suppressed",
            Handled::Withdrawn { .. } => "withdrawn",
            Handled::Unavailable => "unavailable",
            Handled::Malformed => "malformed",
        }
    }
}

struct InFlight {
    ticket: Ticket,
    work: CancellationToken,
}

/// Worker side of the claim protocol.
///
/// Every `New` it is eligible for is raced through the claim store; the
/// winner fulfills it while keeping its hold alive. A need whose signature is
/// held for another job waits until that hold goes away. A `Cancel` stops
/// work in progress and is remembered so a late `New` is ignored.
pub struct ClaimWorker {
    name: String,
    profile: WorkerProfile,
    store: Arc<dyn ClaimStore>,
    fulfiller: Arc<dyn Fulfiller>,
    reporter: Arc<dyn CompletionReporter>,
    cache: NegativeCache,
    config: ClaimConfig,
    inflight: Mutex<HashMap<Signature, InFlight>>,
    /// Wakes parked needs when a hold of this worker ends or a cancel arrives.
    wake: Notify,
    metrics: MetricsHandle,
    shutdown: CancellationToken,
}

impl ClaimWorker {
    pub fn new(
        name: impl Into<String>,
        profile: WorkerProfile,
        store: Arc<dyn ClaimStore>,
        fulfiller: Arc<dyn Fulfiller>,
        reporter: Arc<dyn CompletionReporter>,
    ) -> Self {
        let config = ClaimConfig::default();
        Self {
            name: name.into(),
            profile,
            store,
            fulfiller,
            reporter,
            cache: NegativeCache::new(config.negative_ttl),
            config,
            inflight: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            metrics: metrics::noop(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ClaimConfig) -> Result<Self, AuctionError> {
        config.validate()?;
        self.cache = NegativeCache::new(config.negative_ttl);
        self.config = config;
        Ok(self)
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cancelling `token` stops the worker and aborts work in progress.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn negative_cache(&self) -> &NegativeCache {
        &self.cache
    }

    /// Needs currently being fulfilled.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Subscribe to the topics of `kinds` and handle deliveries until shutdown.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn PubSub>,
        kinds: &[ResourceKind],
    ) -> Result<(), AuctionError> {
        let mut subs = Vec::with_capacity(kinds.len());
        for kind in kinds {
            subs.push(bus.subscribe(&kind.topic()).await?);
        }
        info!(worker = %self.name, topics = subs.len(), "claim worker started");

        let mut consumers = JoinSet::new();
        for sub in subs {
            consumers.spawn(Arc::clone(&self).consume(sub));
        }
        while consumers.join_next().await.is_some() {}

        info!(worker = %self.name, "claim worker stopped");
        Ok(())
    }

    async fn consume(self: Arc<Self>, mut sub: Subscription) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                payload = sub.recv() => match payload {
                    Some(payload) => {
                        let worker = Arc::clone(&self);
                        handlers.spawn(async move {
                            worker.handle_payload(&payload).await;
                        });
                    }
                    None => {
                        debug!(worker = %self.name, topic = sub.topic(), "subscription ended");
                        break;
                    }
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
        // Handlers watch the shutdown token on their own.
        while handlers.join_next().await.is_some() {}
    }

    /// Decode and handle one delivery.
    pub async fn handle_payload(&self, payload: &[u8]) -> Handled {
        match wire::decode(payload) {
            Ok(auction) => self.handle(auction).await,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "discarding malformed auction");
                self.metrics.claim_outcome(Handled::Malformed.as_str());
                Handled::Malformed
            }
        }
    }

    #[instrument(level = "debug", skip(self, auction), fields(worker = %self.name, signature = %auction.signature, kind = ?auction.kind))]
    pub async fn handle(&self, auction: Auction) -> Handled {
        let handled = match auction.kind {
            AuctionKind::New => self.on_new(auction).await,
            AuctionKind::Cancel => self.on_cancel(&auction),
        };
        self.metrics.claim_outcome(handled.as_str());
        handled
    }

    async fn on_new(&self, auction: Auction) -> Handled {
        let Some(ticket) = auction.origin.clone() else {
            warn!("new auction without origin discarded");
            return Handled::Malformed;
        };
        if self.cache.matches(&auction.signature, &ticket) {
            debug!(%ticket, "auction already withdrawn");
            return Handled::Suppressed;
        }
        if !auction.matcher.admits(&self.profile) {
            debug!(resource = %auction.matcher.name, "worker not eligible");
            return Handled::Ineligible;
        }

        let parked_until = Instant::now() + self.config.park_timeout;
        loop {
            let ttl = self.config.claim_ttl;
            let outcome = self
                .with_store_retry(|| {
                    self.store
                        .try_claim(&auction.signature, &ticket, &self.name, ttl)
                })
                .await;

            match outcome {
                Ok(ClaimOutcome::Won(_)) => return self.fulfill(auction, ticket).await,
                Ok(ClaimOutcome::Conflict { holder, ticket: held }) if held == ticket => {
                    debug!(%ticket, %holder, "claim lost");
                    return Handled::Conflict;
                }
                Ok(ClaimOutcome::Conflict { holder, ticket: held }) => {
                    debug!(%ticket, %holder, %held, "signature held for another need, waiting");
                    let parked = self.park(&auction.signature, &ticket, parked_until).await;
                    if let Some(handled) = parked {
                        return handled;
                    }
                }
                Ok(ClaimOutcome::Duplicate) => {
                    debug!(%ticket, "duplicate delivery ignored");
                    return Handled::Duplicate;
                }
                Err(_) if self.shutdown.is_cancelled() => return Handled::Aborted,
                Err(e) => {
                    error!(%ticket, error = %e, "claim store unavailable, failing job");
                    self.fail_job(&ticket, format!("claim store unavailable: {e}"))
                        .await;
                    return Handled::Unavailable;
                }
            }
        }
    }

    /// Wait while another need holds `signature`.
    ///
    /// Returns `None` when it is time to claim again.
    async fn park(
        &self,
        signature: &Signature,
        ticket: &Ticket,
        until: Instant,
    ) -> Option<Handled> {
        let now = Instant::now();
        if now >= until {
            warn!(%ticket, %signature, "signature held by another need for too long");
            self.fail_job(
                ticket,
                format!("resource {signature} stayed claimed by another job"),
            )
            .await;
            return Some(Handled::Failed);
        }

        let poll = self.config.renew_every().min(until - now);
        tokio::select! {
            _ = self.shutdown.cancelled() => return Some(Handled::Aborted),
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
        if self.cache.matches(signature, ticket) {
            debug!(%ticket, "waiting need withdrawn");
            return Some(Handled::Suppressed);
        }
        None
    }

    fn on_cancel(&self, auction: &Auction) -> Handled {
        self.cache
            .remember(&auction.signature, auction.origin.as_ref());

        let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let aborted = match inflight.get(&auction.signature) {
            Some(running)
                if auction
                    .origin
                    .as_ref()
                    .is_none_or(|origin| origin == &running.ticket) =>
            {
                running.work.cancel();
                true
            }
            _ => false,
        };

        drop(inflight);
        self.wake.notify_waiters();

        debug!(aborted, "cancel recorded");
        Handled::Withdrawn { aborted }
    }

    async fn fulfill(&self, auction: Auction, ticket: Ticket) -> Handled {
        let work = self.shutdown.child_token();
        self.track(&auction.signature, &ticket, &work);
        // A cancel may have landed between the cache check and tracking.
        if self.cache.matches(&auction.signature, &ticket) {
            work.cancel();
        }

        let started = Instant::now();
        let handled = self.fulfill_claimed(&auction, &ticket, &work).await;
        self.untrack(&auction.signature, &ticket);
        self.wake.notify_waiters();

        let outcome = match handled {
            Handled::Won => "successful",
            Handled::Failed => "failed",
            _ => "aborted",
        };
        self.metrics
            .fulfillment_finished(outcome, started.elapsed());
        handled
    }

    async fn fulfill_claimed(
        &self,
        auction: &Auction,
        ticket: &Ticket,
        work: &CancellationToken,
    ) -> Handled {
        if work.is_cancelled() {
            self.release(&auction.signature).await;
            return Handled::Aborted;
        }
        if let Err(e) = self.reporter.start(ticket).await {
            warn!(%ticket, error = %e, "job attempt cannot start, releasing claim");
            self.release(&auction.signature).await;
            if e.is_transient() {
                self.fail_job(ticket, format!("job attempt cannot start: {e}"))
                    .await;
                return Handled::Failed;
            }
            return Handled::Aborted;
        }

        let _renewal = self
            .spawn_renewal(auction.signature.clone(), work.clone())
            .drop_guard();

        let policy = self.config.fulfill_retry;
        let mut last_error = String::new();
        for round in 0..policy.attempts {
            if round > 0 {
                tokio::select! {
                    _ = work.cancelled() => break,
                    _ = tokio::time::sleep(policy.delay(round - 1)) => {}
                }
            }

            let result = tokio::select! {
                _ = work.cancelled() => break,
                result = self.fulfiller.fulfill(auction, work.clone()) => result,
            };
            match result {
                Ok(assets) => return self.complete(auction, ticket, assets).await,
                Err(e) => {
                    warn!(%ticket, round = round + 1, error = %e, "fulfillment failed");
                    last_error = e.to_string();
                }
            }
        }

        self.release(&auction.signature).await;
        if work.is_cancelled() {
            if self.shutdown.is_cancelled() || self.cache.matches(&auction.signature, ticket) {
                info!(%ticket, "fulfillment aborted");
                return Handled::Aborted;
            }
            return self.hold_lost(&auction.signature, ticket).await;
        }

        error!(%ticket, error = %last_error, "fulfillment failed after retries");
        self.fail_job(ticket, last_error).await;
        Handled::Failed
    }

    async fn complete(
        &self,
        auction: &Auction,
        ticket: &Ticket,
        assets: BTreeMap<String, String>,
    ) -> Handled {
        let marked = self
            .with_store_retry(|| self.store.mark_fulfilled(&auction.signature, &self.name))
            .await;
        if let Err(e) = marked {
            warn!(%ticket, error = %e, "hold lost before fulfillment was recorded");
            if !self.reclaim_fulfilled(&auction.signature, ticket).await {
                return self.hold_lost(&auction.signature, ticket).await;
            }
        }

        match self
            .reporter
            .complete(ticket, StatusUpdate::successful(assets))
            .await
        {
            Ok(()) => info!(%ticket, "need fulfilled"),
            Err(e) => warn!(%ticket, error = %e, "fulfilled, but the job rejected the report"),
        }
        Handled::Won
    }

    /// Take a lapsed claim again and record it fulfilled straight away.
    async fn reclaim_fulfilled(&self, signature: &Signature, ticket: &Ticket) -> bool {
        let ttl = self.config.claim_ttl;
        let claimed = self
            .with_store_retry(|| self.store.try_claim(signature, ticket, &self.name, ttl))
            .await;
        if !matches!(claimed, Ok(ClaimOutcome::Won(_))) {
            return false;
        }
        self.with_store_retry(|| self.store.mark_fulfilled(signature, &self.name))
            .await
            .is_ok()
    }

    /// The hold on `signature` was lost while working for `ticket`.
    ///
    /// A worker that took the same need over reports it; otherwise the job is failed.
    async fn hold_lost(&self, signature: &Signature, ticket: &Ticket) -> Handled {
        self.release(signature).await;
        let taken_over = match self.with_store_retry(|| self.store.get(signature)).await {
            Ok(claim) => claim.is_some_and(|c| &c.ticket == ticket && c.holder != self.name),
            Err(e) => {
                warn!(%signature, error = %e, "cannot inspect lost claim");
                false
            }
        };
        if taken_over {
            info!(%ticket, "need taken over by another worker");
            return Handled::Aborted;
        }

        error!(%ticket, %signature, "claim lost, failing job");
        self.fail_job(ticket, format!("claim on {signature} lost during fulfillment"))
            .await;
        Handled::Failed
    }

    /// Fail the attempt of `ticket` so it never stays running unattended.
    async fn fail_job(&self, ticket: &Ticket, reason: String) {
        if let Err(e) = self.reporter.start(ticket).await {
            debug!(%ticket, error = %e, "attempt no longer runnable, nothing to fail");
            return;
        }
        if let Err(e) = self
            .reporter
            .complete(ticket, StatusUpdate::failed(reason))
            .await
        {
            warn!(%ticket, error = %e, "failure report rejected");
        }
    }

    async fn release(&self, signature: &Signature) {
        match self
            .with_store_retry(|| self.store.release(signature, &self.name))
            .await
        {
            Ok(released) => trace!(%signature, released, "claim released"),
            Err(e) => warn!(%signature, error = %e, "claim release failed, hold will expire"),
        }
    }

    /// Keep the hold alive until the returned token is cancelled.
    ///
    /// Losing the hold cancels `work`.
    fn spawn_renewal(&self, signature: Signature, work: CancellationToken) -> CancellationToken {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let store = Arc::clone(&self.store);
        let holder = self.name.clone();
        let ttl = self.config.claim_ttl;
        let every = self.config.renew_every();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => return,
                    _ = work.cancelled() => return,
                    _ = tick.tick() => {}
                }
                match store.renew(&signature, &holder, ttl).await {
                    Ok(()) => trace!(%signature, "claim renewed"),
                    Err(e) if e.is_transient() => {
                        warn!(%signature, error = %e, "claim renewal failed");
                    }
                    Err(e) => {
                        warn!(%signature, error = %e, "claim lost, aborting fulfillment");
                        work.cancel();
                        return;
                    }
                }
            }
        });
        stop
    }

    async fn with_store_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ClaimError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClaimError>>,
    {
        let policy = self.config.store_retry;
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry + 1 < policy.attempts => {
                    let delay = policy.delay(retry);
                    warn!(worker = %self.name, error = %e, retry, ?delay, "claim store call failed, retrying");
                    retry += 1;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn track(&self, signature: &Signature, ticket: &Ticket, work: &CancellationToken) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        inflight.insert(
            signature.clone(),
            InFlight {
                ticket: ticket.clone(),
                work: work.clone(),
            },
        );
    }

    fn untrack(&self, signature: &Signature, ticket: &Ticket) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight
            .get(signature)
            .is_some_and(|running| &running.ticket == ticket)
        {
            inflight.remove(signature);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryClaimStore;
    use forge_model::{AuctionSubject, JobId, Matcher, RetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        starts: AtomicUsize,
        reports: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl CompletionReporter for Recorder {
        async fn start(&self, _ticket: &Ticket) -> Result<(), CoreError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn complete(&self, _ticket: &Ticket, update: StatusUpdate) -> Result<(), CoreError> {
            self.reports.lock().unwrap().push(update);
            Ok(())
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Scripted {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fulfiller for Scripted {
        async fn fulfill(
            &self,
            auction: &Auction,
            _ctx: CancellationToken,
        ) -> Result<BTreeMap<String, String>, AuctionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AuctionError::Fulfill("backend down".into()));
            }
            Ok([(auction.matcher.name.clone(), "cid-1".to_string())].into())
        }
    }

    /// Claim store that never answers.
    struct DownStore;

    #[async_trait]
    impl ClaimStore for DownStore {
        async fn try_claim(
            &self,
            _signature: &Signature,
            _ticket: &Ticket,
            _holder: &str,
            _ttl: Duration,
        ) -> Result<ClaimOutcome, ClaimError> {
            Err(ClaimError::Unavailable("store down".into()))
        }

        async fn renew(&self, _: &Signature, _: &str, _: Duration) -> Result<(), ClaimError> {
            Err(ClaimError::Unavailable("store down".into()))
        }

        async fn release(&self, _: &Signature, _: &str) -> Result<bool, ClaimError> {
            Err(ClaimError::Unavailable("store down".into()))
        }

        async fn mark_fulfilled(&self, _: &Signature, _: &str) -> Result<(), ClaimError> {
            Err(ClaimError::Unavailable("store down".into()))
        }

        async fn get(&self, _: &Signature) -> Result<Option<crate::Claim>, ClaimError> {
            Err(ClaimError::Unavailable("store down".into()))
        }
    }

    /// Memory store that refuses to record fulfillment.
    struct UnrecordedStore {
        inner: MemoryClaimStore,
    }

    #[async_trait]
    impl ClaimStore for UnrecordedStore {
        async fn try_claim(
            &self,
            signature: &Signature,
            ticket: &Ticket,
            holder: &str,
            ttl: Duration,
        ) -> Result<ClaimOutcome, ClaimError> {
            self.inner.try_claim(signature, ticket, holder, ttl).await
        }

        async fn renew(
            &self,
            signature: &Signature,
            holder: &str,
            ttl: Duration,
        ) -> Result<(), ClaimError> {
            self.inner.renew(signature, holder, ttl).await
        }

        async fn release(&self, signature: &Signature, holder: &str) -> Result<bool, ClaimError> {
            self.inner.release(signature, holder).await
        }

        async fn mark_fulfilled(
            &self,
            signature: &Signature,
            holder: &str,
        ) -> Result<(), ClaimError> {
            Err(ClaimError::NotHeld {
                signature: signature.clone(),
                holder: holder.to_string(),
            })
        }

        async fn get(&self, signature: &Signature) -> Result<Option<crate::Claim>, ClaimError> {
            self.inner.get(signature).await
        }
    }

    fn auction() -> Auction {
        Auction::need(
            ResourceKind::Storage,
            AuctionSubject {
                config_id: "cfg".into(),
                application_id: "app".into(),
                project_id: "proj".into(),
                branch: "main".into(),
            },
            Matcher::named("bucket").require("zone", "a"),
            Ticket::new(JobId::from("job-1"), 1),
        )
    }

    fn worker(
        fulfiller: Arc<Scripted>,
        reporter: Arc<Recorder>,
        store: Arc<dyn ClaimStore>,
    ) -> ClaimWorker {
        let config = ClaimConfig {
            fulfill_retry: RetryPolicy {
                attempts: 3,
                first_ms: 10,
                max_ms: 100,
                factor: 2.0,
            },
            ..Default::default()
        };
        ClaimWorker::new(
            "w1",
            WorkerProfile::default().with_label("zone", "a"),
            store,
            fulfiller,
            reporter,
        )
        .with_config(config)
        .unwrap()
    }

    #[tokio::test]
    async fn winner_reports_start_then_success() {
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(MemoryClaimStore::new());
        let w = worker(Arc::new(Scripted::failing(0)), reporter.clone(), store.clone());

        assert_eq!(w.handle(auction()).await, Handled::Won);
        assert_eq!(reporter.starts.load(Ordering::SeqCst), 1);

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, forge_model::JobStatus::Successful);
        assert_eq!(reports[0].assets.get("bucket").map(String::as_str), Some("cid-1"));
        drop(reports);

        let claim = store.get(&auction().signature).await.unwrap().unwrap();
        assert_eq!(claim.state, crate::ClaimState::Fulfilled);
        assert_eq!(w.in_flight(), 0);
    }

    #[tokio::test]
    async fn ineligible_worker_has_no_side_effects() {
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(MemoryClaimStore::new());
        let w = ClaimWorker::new(
            "w2",
            WorkerProfile::default().with_label("zone", "b"),
            store.clone(),
            Arc::new(Scripted::failing(0)),
            reporter.clone(),
        );

        assert_eq!(w.handle(auction()).await, Handled::Ineligible);
        assert!(store.get(&auction().signature).await.unwrap().is_none());
        assert_eq!(reporter.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let fulfiller = Arc::new(Scripted::failing(2));
        let reporter = Arc::new(Recorder::default());
        let w = worker(fulfiller.clone(), reporter.clone(), Arc::new(MemoryClaimStore::new()));

        assert_eq!(w.handle(auction()).await, Handled::Won);
        assert_eq!(fulfiller.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_release_and_fail() {
        let fulfiller = Arc::new(Scripted::failing(10));
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(MemoryClaimStore::new());
        let w = worker(fulfiller.clone(), reporter.clone(), store.clone());

        assert_eq!(w.handle(auction()).await, Handled::Failed);
        assert_eq!(fulfiller.calls.load(Ordering::SeqCst), 3);
        assert!(store.get(&auction().signature).await.unwrap().is_none());

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports[0].status, forge_model::JobStatus::Failed);
        assert!(reports[0].error.as_deref().unwrap_or_default().contains("backend down"));
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_fails_job() {
        let fulfiller = Arc::new(Scripted::failing(0));
        let reporter = Arc::new(Recorder::default());
        let w = worker(fulfiller.clone(), reporter.clone(), Arc::new(DownStore));

        assert_eq!(w.handle(auction()).await, Handled::Unavailable);
        assert_eq!(fulfiller.calls.load(Ordering::SeqCst), 0);

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, forge_model::JobStatus::Failed);
        assert!(reports[0].error.as_deref().unwrap_or_default().contains("store down"));
    }

    #[tokio::test(start_paused = true)]
    async fn unrecorded_fulfillment_fails_job() {
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(UnrecordedStore {
            inner: MemoryClaimStore::new(),
        });
        let w = worker(Arc::new(Scripted::failing(0)), reporter.clone(), store);

        assert_eq!(w.handle(auction()).await, Handled::Failed);

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, forge_model::JobStatus::Failed);
        assert!(reports[0].error.as_deref().unwrap_or_default().contains("lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn need_waits_for_other_job_then_claims() {
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(MemoryClaimStore::new());
        let other = Ticket::new(JobId::from("job-0"), 1);
        store
            .try_claim(&auction().signature, &other, "w0", ClaimConfig::DEFAULT_CLAIM_TTL)
            .await
            .unwrap();

        let w = Arc::new(worker(Arc::new(Scripted::failing(0)), reporter.clone(), store.clone()));
        let waiting = {
            let w = w.clone();
            tokio::spawn(async move { w.handle(auction()).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(reporter.reports.lock().unwrap().is_empty());

        store.mark_fulfilled(&auction().signature, "w0").await.unwrap();
        assert_eq!(waiting.await.unwrap(), Handled::Won);

        let claim = store.get(&auction().signature).await.unwrap().unwrap();
        assert_eq!(claim.ticket, Ticket::new(JobId::from("job-1"), 1));
        assert_eq!(claim.state, crate::ClaimState::Fulfilled);
        assert_eq!(
            reporter.reports.lock().unwrap()[0].status,
            forge_model::JobStatus::Successful
        );
    }

    #[tokio::test(start_paused = true)]
    async fn need_held_by_other_job_too_long_fails() {
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(MemoryClaimStore::new());
        let other = Ticket::new(JobId::from("job-0"), 1);
        store
            .try_claim(&auction().signature, &other, "w0", Duration::from_secs(86_400))
            .await
            .unwrap();

        let w = worker(Arc::new(Scripted::failing(0)), reporter.clone(), store)
            .with_config(ClaimConfig {
                park_timeout: Duration::from_secs(60),
                ..ClaimConfig::default()
            })
            .unwrap();

        assert_eq!(w.handle(auction()).await, Handled::Failed);
        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.as_deref().unwrap_or_default().contains("stayed claimed"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_need_stops_on_cancel() {
        let reporter = Arc::new(Recorder::default());
        let store = Arc::new(MemoryClaimStore::new());
        let other = Ticket::new(JobId::from("job-0"), 1);
        store
            .try_claim(&auction().signature, &other, "w0", Duration::from_secs(86_400))
            .await
            .unwrap();

        let w = Arc::new(worker(Arc::new(Scripted::failing(0)), reporter.clone(), store));
        let waiting = {
            let w = w.clone();
            tokio::spawn(async move { w.handle(auction()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        w.handle(auction().withdrawal()).await;
        assert_eq!(waiting.await.unwrap(), Handled::Suppressed);
        assert!(reporter.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_without_work_is_remembered() {
        let w = worker(
            Arc::new(Scripted::failing(0)),
            Arc::new(Recorder::default()),
            Arc::new(MemoryClaimStore::new()),
        );

        assert_eq!(
            w.handle(auction().withdrawal()).await,
            Handled::Withdrawn { aborted: false }
        );
        assert_eq!(w.negative_cache().len(), 1);
        assert_eq!(w.handle(auction()).await, Handled::Suppressed);
    }

    #[tokio::test]
    async fn malformed_payload_is_discarded() {
        let w = worker(
            Arc::new(Scripted::failing(0)),
            Arc::new(Recorder::default()),
            Arc::new(MemoryClaimStore::new()),
        );
        assert_eq!(w.handle_payload(&[0xff, 0x01]).await, Handled::Malformed);
    }
}
