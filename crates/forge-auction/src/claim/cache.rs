use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use forge_model::{Signature, Ticket};
use tokio::time::Instant;

/// Cancels seen by a worker, remembered for a while so that a `New`
/// delivered after its own `Cancel` is discarded.
pub struct NegativeCache {
    ttl: Duration,
    entries: Mutex<HashMap<Signature, Vec<Entry>>>,
}

struct Entry {
    /// `None` cancels every ticket of the signature.
    origin: Option<Ticket>,
    expires_at: Instant,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, signature: &Signature, origin: Option<&Ticket>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        entries.retain(|_, list| {
            list.retain(|e| e.expires_at > now);
            !list.is_empty()
        });

        let list = entries.entry(signature.clone()).or_default();
        list.retain(|e| e.origin.as_ref() != origin);
        list.push(Entry {
            origin: origin.cloned(),
            expires_at: now + self.ttl,
        });
    }

    /// Whether a remembered cancel covers `ticket`'s need.
    pub fn matches(&self, signature: &Signature, ticket: &Ticket) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(signature).is_some_and(|list| {
            list.iter().any(|e| {
                e.expires_at > now && e.origin.as_ref().is_none_or(|origin| origin == ticket)
            })
        })
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_model::JobId;

    fn ticket(attempt: u32) -> Ticket {
        Ticket::new(JobId::from("job-1"), attempt)
    }

    #[tokio::test(start_paused = true)]
    async fn remembers_until_ttl() {
        let cache = NegativeCache::new(Duration::from_secs(600));
        let sig = Signature::from("sig");
        cache.remember(&sig, Some(&ticket(1)));

        assert!(cache.matches(&sig, &ticket(1)));
        assert!(!cache.matches(&sig, &ticket(2)));
        assert!(!cache.matches(&Signature::from("other"), &ticket(1)));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!cache.matches(&sig, &ticket(1)));
    }

    #[tokio::test]
    async fn cancel_without_origin_matches_any_ticket() {
        let cache = NegativeCache::new(Duration::from_secs(600));
        let sig = Signature::from("sig");
        cache.remember(&sig, None);

        assert!(cache.matches(&sig, &ticket(1)));
        assert!(cache.matches(&sig, &ticket(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_pruned() {
        let cache = NegativeCache::new(Duration::from_secs(1));
        cache.remember(&Signature::from("a"), Some(&ticket(1)));
        cache.remember(&Signature::from("a"), Some(&ticket(1)));
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.remember(&Signature::from("b"), None);
        assert_eq!(cache.len(), 1);
    }
}
