//! Prometheus backend for forge metrics.
//!
//! [`PrometheusMetrics`] implements [`forge_core::MetricsBackend`] on its own
//! [`Registry`]. Serving `/metrics` is left to the embedding binary:
//!
//! ```rust,ignore
//! async fn metrics(State(metrics): State<PrometheusMetrics>) -> Response {
//!     match metrics.encode() {
//!         Ok(body) => ([(CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
//!         Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
//!     }
//! }
//! ```
//!
//! ## Metrics
//! - `forge_job_transitions_total{from, to}` - Counter
//! - `forge_jobs_retried_total` - Counter
//! - `forge_stale_reports_total` - Counter
//! - `forge_auctions_published_total{kind, resource}` - Counter
//! - `forge_claim_outcomes_total{outcome}` - Counter
//! - `forge_fulfillment_duration_seconds{outcome}` - Histogram

mod backend;
pub use backend::PrometheusMetrics;

pub use prometheus::{Encoder, Registry, TEXT_FORMAT, TextEncoder};
