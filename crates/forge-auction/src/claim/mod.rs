//! Worker side of the auction protocol.

mod cache;
pub use cache::NegativeCache;

mod config;
pub use config::ClaimConfig;

mod store;
pub use store::{Claim, ClaimOutcome, ClaimState, ClaimStore, MemoryClaimStore};

mod worker;
pub use worker::{ClaimWorker, CompletionReporter, Fulfiller, Handled, RegistryReporter};
