//! Metrics hook used by the registry and the claim workers.
//!
//! Every method has an empty default so backends only override what they export.

use std::{sync::Arc, time::Duration};

use forge_model::{AuctionKind, JobStatus, ResourceKind};

pub trait MetricsBackend: Send + Sync + 'static {
    /// A job attempt moved along a state-machine edge.
    fn job_transition(&self, _from: JobStatus, _to: JobStatus) {}

    /// A job was re-queued into a new attempt.
    fn job_retried(&self) {}

    /// A status report for a superseded attempt was discarded.
    fn stale_report(&self) {}

    /// An auction was accepted by the transport.
    fn auction_published(&self, _kind: AuctionKind, _resource: ResourceKind) {}

    /// Outcome of one delivered auction on a worker (`won`, `conflict`, `ineligible`, ...).
    fn claim_outcome(&self, _outcome: &'static str) {}

    /// A won claim finished fulfilling (`successful`, `failed`, `aborted`).
    fn fulfillment_finished(&self, _outcome: &'static str, _elapsed: Duration) {}
}

pub type MetricsHandle = Arc<dyn MetricsBackend>;

/// Backend that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsBackend for NoopMetrics {}

pub fn noop() -> MetricsHandle {
    Arc::new(NoopMetrics)
}
