use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use forge_model::{Signature, Ticket};
use tokio::time::Instant;

use crate::ClaimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// A worker is fulfilling the need; the hold lapses at `expires_at`.
    Held,
    /// The need was fulfilled for the claim's ticket.
    Fulfilled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub signature: Signature,
    pub ticket: Ticket,
    pub holder: String,
    pub state: ClaimState,
    pub expires_at: Instant,
}

impl Claim {
    pub fn is_live(&self, now: Instant) -> bool {
        match self.state {
            ClaimState::Held => self.expires_at > now,
            ClaimState::Fulfilled => true,
        }
    }
}

/// Result of a compare-and-set on a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now holds the claim.
    Won(Claim),
    /// Another live claim exists; `ticket` is the need it was taken for.
    Conflict { holder: String, ticket: Ticket },
    /// This ticket was already claimed by the caller or fulfilled.
    Duplicate,
}

/// Authoritative, cross-worker record of who fulfills which need.
///
/// `try_claim` is the only synchronization point between workers and must be
/// atomic per signature.
#[async_trait]
pub trait ClaimStore: Send + Sync + 'static {
    /// Take the claim on `signature` for `ticket` unless a live claim exists.
    ///
    /// An expired hold, or a fulfilled claim of another ticket, is replaced.
    async fn try_claim(
        &self,
        signature: &Signature,
        ticket: &Ticket,
        holder: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, ClaimError>;

    /// Push out the expiry of a hold owned by `holder`.
    async fn renew(&self, signature: &Signature, holder: &str, ttl: Duration)
    -> Result<(), ClaimError>;

    /// Drop a hold owned by `holder`. Returns whether anything was released.
    async fn release(&self, signature: &Signature, holder: &str) -> Result<bool, ClaimError>;

    /// Turn a hold owned by `holder` into a permanent fulfilled record.
    async fn mark_fulfilled(&self, signature: &Signature, holder: &str) -> Result<(), ClaimError>;

    async fn get(&self, signature: &Signature) -> Result<Option<Claim>, ClaimError>;
}

/// In-memory claim store shared by workers of one process.
#[derive(Clone, Default)]
pub struct MemoryClaimStore {
    claims: Arc<Mutex<HashMap<Signature, Claim>>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> Result<MutexGuard<'_, HashMap<Signature, Claim>>, ClaimError> {
        self.claims
            .lock()
            .map_err(|_| ClaimError::Unavailable("claim store lock poisoned".into()))
    }

    fn not_held(signature: &Signature, holder: &str) -> ClaimError {
        ClaimError::NotHeld {
            signature: signature.clone(),
            holder: holder.to_string(),
        }
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn try_claim(
        &self,
        signature: &Signature,
        ticket: &Ticket,
        holder: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, ClaimError> {
        let now = Instant::now();
        let mut claims = self.claims()?;

        if let Some(existing) = claims.get(signature) {
            match existing.state {
                ClaimState::Fulfilled if &existing.ticket == ticket => {
                    return Ok(ClaimOutcome::Duplicate);
                }
                ClaimState::Held if existing.is_live(now) => {
                    if &existing.ticket == ticket && existing.holder == holder {
                        return Ok(ClaimOutcome::Duplicate);
                    }
                    return Ok(ClaimOutcome::Conflict {
                        holder: existing.holder.clone(),
                        ticket: existing.ticket.clone(),
                    });
                }
                _ => {}
            }
        }

        let claim = Claim {
            signature: signature.clone(),
            ticket: ticket.clone(),
            holder: holder.to_string(),
            state: ClaimState::Held,
            expires_at: now + ttl,
        };
        claims.insert(signature.clone(), claim.clone());
        Ok(ClaimOutcome::Won(claim))
    }

    async fn renew(
        &self,
        signature: &Signature,
        holder: &str,
        ttl: Duration,
    ) -> Result<(), ClaimError> {
        let now = Instant::now();
        let mut claims = self.claims()?;
        match claims.get_mut(signature) {
            Some(claim)
                if claim.holder == holder
                    && claim.state == ClaimState::Held
                    && claim.is_live(now) =>
            {
                claim.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(Self::not_held(signature, holder)),
        }
    }

    async fn release(&self, signature: &Signature, holder: &str) -> Result<bool, ClaimError> {
        let mut claims = self.claims()?;
        let owned = claims
            .get(signature)
            .is_some_and(|c| c.holder == holder && c.state == ClaimState::Held);
        if owned {
            claims.remove(signature);
        }
        Ok(owned)
    }

    async fn mark_fulfilled(&self, signature: &Signature, holder: &str) -> Result<(), ClaimError> {
        let now = Instant::now();
        let mut claims = self.claims()?;
        match claims.get_mut(signature) {
            Some(claim)
                if claim.holder == holder
                    && claim.state == ClaimState::Held
                    && claim.is_live(now) =>
            {
                claim.state = ClaimState::Fulfilled;
                Ok(())
            }
            _ => Err(Self::not_held(signature, holder)),
        }
    }

    async fn get(&self, signature: &Signature) -> Result<Option<Claim>, ClaimError> {
        let claims = self.claims()?;
        Ok(claims.get(signature).cloned())
    }
}
