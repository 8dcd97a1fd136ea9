//! Bounded fan-out broadcast of media buffers
//!
//! Each subscriber owns an independent bounded FIFO queue with a
//! drop-oldest overflow policy, so a slow consumer never stalls capture or
//! any other consumer. Publishing never suspends on queue capacity.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

/// A bounded single-consumer queue of media buffers.
///
/// `push` never waits: when the queue is full the oldest buffered item is
/// dropped to admit the new one. `close` is idempotent; after close,
/// pushes are rejected and `recv` drains the remaining items then reports
/// end of stream.
pub struct MediaQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
}

struct QueueState {
    items: std::collections::VecDeque<Bytes>,
    closed: bool,
}

impl MediaQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: std::collections::VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, evicting the oldest buffered item on overflow.
    ///
    /// Returns false if the queue is closed (the item is not enqueued).
    pub async fn push(&self, item: Bytes) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        state.items.push_back(item);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Receive the next item, waiting until one is available.
    ///
    /// Returns None once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Returns true only for the call that performed the
    /// close, so callers can assert exactly-once semantics.
    pub async fn close(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);
        self.notify.notify_one();
        true
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Items evicted by the drop-oldest policy since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A subscriber's handle to its queue.
///
/// Ephemeral: created by `BroadcastHub::subscribe`, destroyed on
/// disconnect or pipeline stop. Single consumer.
pub struct Subscription {
    id: String,
    queue: Arc<MediaQueue>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next buffer; None once the hub closed this queue.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.queue.recv().await
    }

    /// Items this subscriber lost to the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

/// Fan-out hub distributing buffers to registered subscriber queues.
///
/// The subscriber table is behind a read/write lock: publishes run
/// concurrently under the read lock while subscribe/unsubscribe serialize
/// under the write lock.
pub struct BroadcastHub {
    label: &'static str,
    capacity: usize,
    subscribers: RwLock<HashMap<String, Arc<MediaQueue>>>,
}

impl BroadcastHub {
    /// `label` names the hub in logs (e.g. "frames", "audio").
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            capacity,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber queue under `id`.
    ///
    /// Re-subscribing with an id already in the table closes the previous
    /// queue before replacing it.
    pub async fn subscribe(&self, id: impl Into<String>) -> Subscription {
        let id = id.into();
        let queue = Arc::new(MediaQueue::new(self.capacity));
        let mut subs = self.subscribers.write().await;
        if let Some(old) = subs.insert(id.clone(), Arc::clone(&queue)) {
            warn!(hub = self.label, subscriber = %id, "replacing existing subscription");
            old.close().await;
        }
        debug!(hub = self.label, subscriber = %id, total = subs.len(), "subscribed");
        Subscription { id, queue }
    }

    /// Remove a subscriber and close its queue. Double-unsubscribe is a
    /// no-op.
    pub async fn unsubscribe(&self, id: &str) {
        let removed = self.subscribers.write().await.remove(id);
        if let Some(queue) = removed {
            queue.close().await;
            debug!(hub = self.label, subscriber = %id, "unsubscribed");
        }
    }

    /// Deliver a buffer to every subscriber queue. Never blocks on a full
    /// queue; returns the number of queues that accepted the buffer.
    pub async fn publish(&self, payload: Bytes) -> usize {
        let subs = self.subscribers.read().await;
        let mut delivered = 0;
        for queue in subs.values() {
            if queue.push(payload.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close every subscriber queue exactly once and clear the table.
    pub async fn close_all(&self) {
        let mut subs = self.subscribers.write().await;
        for (id, queue) in subs.drain() {
            if !queue.close().await {
                debug!(hub = self.label, subscriber = %id, "queue was already closed");
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
