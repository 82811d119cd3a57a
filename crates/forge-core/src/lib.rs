pub mod error;
pub use error::CoreError;

mod locks;
pub use locks::KeyedLocks;

pub mod logs;
pub use logs::{LogBook, LogReader};

pub mod metrics;
pub use metrics::{MetricsBackend, MetricsHandle, NoopMetrics};

mod hooks;
pub use hooks::AuctionControl;

pub mod store;
pub use store::{JobStore, MemoryJobStore};

mod registry;
pub use registry::JobRegistry;

mod system;
pub use system::{init_uptime, node_id, uptime_seconds};
