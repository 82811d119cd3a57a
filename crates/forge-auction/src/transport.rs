use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::TransportError;

/// Topic-based publish/subscribe.
///
/// Delivery is at-least-once and may reorder or duplicate messages; handlers
/// on the receiving side must be idempotent.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Returns once the transport has accepted `payload`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;
}

/// Stream of payloads published on one topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Payload already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

/// In-process bus fanning every publish out to the topic's subscribers.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

struct MemoryBusInner {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl MemoryBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Each subscriber buffers up to `capacity` payloads; publishers wait when it is full.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryBusInner {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Reject further publishes and end every subscription.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics.clear();
    }

    /// Live subscribers of `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        let topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let senders = {
            let mut topics = self
                .inner
                .topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(subs) = topics.get_mut(topic) else {
                trace!(topic, "publish without subscribers");
                return Ok(());
            };
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };

        for tx in senders {
            // A subscriber dropped mid-publish is not an error for the publisher.
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(topic, rx))
    }
}
