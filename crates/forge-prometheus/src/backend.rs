use std::time::Duration;

use forge_core::MetricsBackend;
use forge_model::{AuctionKind, JobStatus, ResourceKind};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
    proto::MetricFamily,
};

/// Counters and histograms for the registry and the claim protocol.
///
/// Cheap to clone; clones share the same metrics.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    transitions: IntCounterVec,
    retried: IntCounter,
    stale: IntCounter,
    published: IntCounterVec,
    claims: IntCounterVec,
    fulfillment: HistogramVec,
}

impl PrometheusMetrics {
    /// Register every metric on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Register every metric on `registry`.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let transitions = IntCounterVec::new(
            Opts::new("forge_job_transitions_total", "Job status transitions"),
            &["from", "to"],
        )?;
        let retried = IntCounter::new("forge_jobs_retried_total", "Jobs re-queued by retry")?;
        let stale = IntCounter::new(
            "forge_stale_reports_total",
            "Status reports discarded for superseded attempts",
        )?;
        let published = IntCounterVec::new(
            Opts::new("forge_auctions_published_total", "Auctions accepted by the transport"),
            &["kind", "resource"],
        )?;
        let claims = IntCounterVec::new(
            Opts::new("forge_claim_outcomes_total", "Outcomes of delivered auctions"),
            &["outcome"],
        )?;
        let fulfillment = HistogramVec::new(
            HistogramOpts::new(
                "forge_fulfillment_duration_seconds",
                "Time from winning a claim to finishing its fulfillment",
            )
            .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["outcome"],
        )?;

        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(retried.clone()))?;
        registry.register(Box::new(stale.clone()))?;
        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(fulfillment.clone()))?;

        Ok(Self {
            registry,
            transitions,
            retried,
            stale,
            published,
            claims,
            fulfillment,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// All metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.gather())
    }
}

impl MetricsBackend for PrometheusMetrics {
    fn job_transition(&self, from: JobStatus, to: JobStatus) {
        self.transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }

    fn job_retried(&self) {
        self.retried.inc();
    }

    fn stale_report(&self) {
        self.stale.inc();
    }

    fn auction_published(&self, kind: AuctionKind, resource: ResourceKind) {
        let kind = match kind {
            AuctionKind::New => "new",
            AuctionKind::Cancel => "cancel",
        };
        self.published
            .with_label_values(&[kind, resource.as_str()])
            .inc();
    }

    fn claim_outcome(&self, outcome: &'static str) {
        self.claims.with_label_values(&[outcome]).inc();
    }

    fn fulfillment_finished(&self, outcome: &'static str, elapsed: Duration) {
        self.fulfillment
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }
}
