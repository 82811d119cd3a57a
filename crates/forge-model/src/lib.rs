//! Domain types shared by the forge crates.
//!
//! Everything here is plain data: jobs and their status machine, auction
//! announcements and their dedup signatures, and retry policies. Behaviour
//! that needs a runtime lives in `forge-core` and `forge-auction`.

mod job_id;
pub use job_id::JobId;

mod job_status;
pub use job_status::JobStatus;

mod job_meta;
pub use job_meta::JobMeta;

mod job;
pub use job::{Job, LogRef, StatusUpdate};

mod job_query;
pub use job_query::{JobPage, JobQuery};

mod auction;
pub use auction::{
    Auction, AuctionKind, AuctionSubject, Matcher, ResourceKind, Signature, Ticket, WorkerProfile,
};

mod retry;
pub use retry::RetryPolicy;

mod error;
pub use error::ModelError;

/// Project identifier a job belongs to.
pub type ProjectId = String;

/// Execution counter of a job; the first run is attempt 1.
pub type Attempt = u32;

/// Identifier of a log resource (one log stream of one attempt).
pub type LogResourceId = String;
