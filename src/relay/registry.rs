//! Downstream consumer registry
//!
//! Each consumer owns a small bounded queue. The ingest loop offers every
//! chunk without waiting, holding the registry lock only for that pass:
//!
//! - queue full: the oldest queued chunk is discarded to make room, so a
//!   slow consumer always resumes at the newest frame
//! - consumer gone: it is evicted
//!
//! Neither case blocks the ingest loop or affects other consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;

/// Result of offering one chunk to every consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Older chunks discarded from full queues
    pub dropped: usize,
    pub evicted: usize,
}

/// Per-consumer queue shared by the registry and the subscription
#[derive(Debug)]
struct ConsumerQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Bytes>,
    closed: bool,
}

enum Offer {
    Queued,
    ReplacedOldest,
    Closed,
}

impl ConsumerQueue {
    fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::with_capacity(depth),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    fn offer(&self, chunk: &Bytes, depth: usize) -> Offer {
        let mut state = self.lock();
        if state.closed {
            return Offer::Closed;
        }

        let replaced = if state.chunks.len() >= depth {
            state.chunks.pop_front();
            true
        } else {
            false
        };
        state.chunks.push_back(chunk.clone());
        drop(state);

        self.ready.notify_one();
        if replaced {
            Offer::ReplacedOldest
        } else {
            Offer::Queued
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut state = self.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the check and
            // this await is not lost
            self.ready.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Set of consumers of one relay
#[derive(Debug)]
pub struct ConsumerRegistry {
    consumers: Mutex<HashMap<u64, Arc<ConsumerQueue>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl ConsumerRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Add a consumer; it is removed again when the subscription drops
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ConsumerQueue::new(self.queue_depth));
        self.lock().insert(id, Arc::clone(&queue));

        Subscription {
            id,
            queue,
            registry: Arc::clone(self),
        }
    }

    /// Remove a consumer; returns false if it was already gone
    ///
    /// A removed consumer's `recv` drains what is queued, then returns `None`.
    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.lock().remove(&id) {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Number of registered consumers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Offer a chunk to every consumer without waiting on any of them
    pub fn broadcast(&self, chunk: &Bytes) -> Delivery {
        let mut delivery = Delivery::default();
        let mut consumers = self.lock();

        consumers.retain(|id, queue| match queue.offer(chunk, self.queue_depth) {
            Offer::Queued => {
                delivery.delivered += 1;
                true
            }
            Offer::ReplacedOldest => {
                delivery.delivered += 1;
                delivery.dropped += 1;
                true
            }
            Offer::Closed => {
                tracing::debug!(consumer_id = *id, "Evicting closed consumer");
                delivery.evicted += 1;
                false
            }
        });

        delivery
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ConsumerQueue>>> {
        match self.consumers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Receiving side of one consumer
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    queue: Arc<ConsumerQueue>,
    registry: Arc<ConsumerRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next chunk, oldest queued first, or `None` once the consumer has
    /// been removed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.queue.pop().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        if self.registry.unsubscribe(self.id) {
            tracing::debug!(consumer_id = self.id, "Consumer unsubscribed");
        }
    }
}
