//! Live-subscriber fan-out.
//!
//! Each subscription is a bounded queue of events. When a slow consumer's
//! queue is full the oldest undelivered event is dropped so the publishing
//! side never blocks; drops are counted per subscription and logged at
//! debug level. Dropped `Subscription` handles are pruned from the registry
//! on the next publish.

use crate::metrics::{AnomalyRecord, EngineState, MetricSample};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Default queue capacity handed to transports that do not specify one.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Per-sample and per-anomaly update events pushed to live subscribers.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    SampleUpdate {
        sample: MetricSample,
        is_anomaly: bool,
        raw_score: Option<f64>,
    },
    AnomalyReport {
        record: AnomalyRecord,
    },
    StateUpdate {
        state: EngineState,
    },
}

struct SubscriptionInner {
    queue: Mutex<VecDeque<BusEvent>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Receiving side of one subscription. Dropping the handle unsubscribes.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Pop the next event, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<BusEvent> {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self
                .inner
                .available
                .wait_timeout_while(queue, timeout, |q| q.is_empty())
                .unwrap();
            queue = guard;
        }
        queue.pop_front()
    }

    /// Pop the next event without waiting.
    pub fn try_recv(&self) -> Option<BusEvent> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    /// Events discarded from the head of this queue because the consumer
    /// fell behind.
    pub fn drop_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Registry of live subscribers.
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubscriptionInner>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber with a bounded queue of `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            available: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().unwrap().push(Arc::clone(&inner));
        Subscription { inner }
    }

    /// Deliver an event to every live subscriber, dropping from the head of
    /// any queue that is full. Never blocks on a consumer.
    pub fn publish(&self, event: &BusEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| !sub.closed.load(Ordering::Acquire));

        for sub in subscribers.iter() {
            let mut queue = sub.queue.lock().unwrap();
            if queue.len() == sub.capacity {
                queue.pop_front();
                let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("subscriber queue full, dropped oldest event (total {})", dropped);
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.available.notify_one();
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| !sub.closed.load(Ordering::Acquire));
        subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
