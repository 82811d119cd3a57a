//! Resource auctions: announcing needs over pub/sub and arbitrating which
//! worker fulfills each of them.
//!
//! The publisher side is [`AuctionBroker`] (plus [`Dispatcher`], which turns a
//! job into an auction). The worker side is [`ClaimWorker`], which races other
//! workers through a shared [`ClaimStore`].

pub mod error;
pub use error::{AuctionError, ClaimError, TransportError};

pub mod wire;

mod transport;
pub use transport::{MemoryBus, PubSub, Subscription};

mod broker;
pub use broker::AuctionBroker;

mod dispatcher;
pub use dispatcher::{Dispatcher, ResourceNeed};

pub mod claim;
pub use claim::{
    Claim, ClaimConfig, ClaimOutcome, ClaimState, ClaimStore, ClaimWorker, CompletionReporter,
    Fulfiller, Handled, MemoryClaimStore, NegativeCache, RegistryReporter,
};
