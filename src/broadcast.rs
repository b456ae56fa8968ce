//! Fan-out of live samples.
//!
//! One producer, any number of subscribers. Each subscriber gets its own
//! bounded channel and delivery never waits: a full channel loses that sample
//! for that subscriber only, and a closed one is dropped from the registry
//! for good. The most recent sample is cached for late joiners.

use crate::sample::Sample;
use futures_lite::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiving end handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Sample>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next sample, or `None` once the subscriber has been removed.
    pub async fn recv(&mut self) -> Option<Arc<Sample>> {
        self.rx.recv().await
    }

    /// Stop receiving. The broadcaster prunes the entry on its next delivery.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for Subscription {
    type Item = Arc<Sample>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<Sample>>>,
    next_id: u64,
    latest: Option<Arc<Sample>>,
    published: u64,
}

#[derive(Debug)]
pub struct StreamBroadcaster {
    registry: Mutex<Registry>,
    buffer: usize,
}

impl Default for StreamBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl StreamBroadcaster {
    /// `buffer` is the per-subscriber queue depth.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            buffer: buffer.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut registry = self.registry();
        let id = SubscriberId(registry.next_id);
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        info!(subscriber = %id, total = registry.subscribers.len(), "Subscriber added");
        Subscription { id, rx }
    }

    /// Returns `false` if `id` was not registered (already pruned, or never existed).
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut registry = self.registry();
        let removed = registry.subscribers.remove(&id).is_some();
        if removed {
            info!(subscriber = %id, total = registry.subscribers.len(), "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    /// Most recent sample, `None` until the first one is published.
    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.registry().latest.clone()
    }

    /// Number of samples published so far.
    pub fn published(&self) -> u64 {
        self.registry().published
    }

    /// Cache `sample` and hand it to every subscriber without waiting.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, sample: Sample) -> usize {
        let sample = Arc::new(sample);
        let mut registry = self.registry();
        registry.latest = Some(Arc::clone(&sample));
        registry.published += 1;

        let mut delivered = 0;
        registry.subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&sample)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %id, "Subscriber lagging, sample dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %id, "Subscriber gone, pruning");
                false
            }
        });
        delivered
    }
}
