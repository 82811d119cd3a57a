use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use forge_auction::{AuctionError, Fulfiller};
use forge_model::Auction;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pretends to provision the resource: waits, then hands out a fake address.
pub struct SimulatedFulfiller {
    delay: Duration,
}

impl SimulatedFulfiller {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Fulfiller for SimulatedFulfiller {
    async fn fulfill(
        &self,
        auction: &Auction,
        ctx: CancellationToken,
    ) -> Result<BTreeMap<String, String>, AuctionError> {
        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(AuctionError::Fulfill("provisioning cancelled".into()));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        let address = format!("sim://{}/{}", auction.resource_kind, auction.signature);
        debug!(signature = %auction.signature, %address, "resource provisioned");
        Ok([(auction.matcher.name.clone(), address)].into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_model::{AuctionSubject, JobId, Matcher, ResourceKind, Ticket};

    fn auction() -> Auction {
        Auction::need(
            ResourceKind::Storage,
            AuctionSubject {
                config_id: "c".into(),
                application_id: "a".into(),
                project_id: "p".into(),
                branch: "main".into(),
            },
            Matcher::named("/assets"),
            Ticket::new(JobId::from("j1"), 1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn provisions_after_delay() {
        let fulfiller = SimulatedFulfiller::new(Duration::from_secs(2));
        let assets = fulfiller
            .fulfill(&auction(), CancellationToken::new())
            .await
            .unwrap();
        assert!(assets["/assets"].starts_with("sim://storage/"));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let fulfiller = SimulatedFulfiller::new(Duration::from_secs(3600));
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(fulfiller.fulfill(&auction(), ctx).await.is_err());
    }
}
