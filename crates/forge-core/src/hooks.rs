use async_trait::async_trait;
use forge_model::JobId;

use crate::CoreError;

/// Publisher-side view of the auctions a job has open.
///
/// Implemented by the auction broker; the registry calls it when a job is
/// cancelled or an attempt finishes.
#[async_trait]
pub trait AuctionControl: Send + Sync + 'static {
    /// Withdraw every auction still open for `job`. Returns how many were withdrawn.
    async fn withdraw_job(&self, job: &JobId) -> Result<usize, CoreError>;

    /// Forget the auctions of a job whose attempt finished on its own.
    fn settle_job(&self, job: &JobId);
}
