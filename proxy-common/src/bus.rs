//! Event bus with bounded per-subscriber queues.
//!
//! Publishers never block: when a subscriber queue is full the oldest
//! event is dropped and that subscriber's drop counter is incremented.
//! Per topic, events reach each subscriber in publish order (modulo
//! drops). Subscribers that went away are reaped on the next publish.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    NewRequest,
    Intercept,
    ProxyStatus,
    WebsocketMessage,
    IntruderResult,
    IntruderProgress,
    SpiderUrl,
    SpiderProgress,
    ScanProgress,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::NewRequest,
        Topic::Intercept,
        Topic::ProxyStatus,
        Topic::WebsocketMessage,
        Topic::IntruderResult,
        Topic::IntruderProgress,
        Topic::SpiderUrl,
        Topic::SpiderProgress,
        Topic::ScanProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NewRequest => "new_request",
            Topic::Intercept => "intercept",
            Topic::ProxyStatus => "proxy_status",
            Topic::WebsocketMessage => "websocket_message",
            Topic::IntruderResult => "intruder_result",
            Topic::IntruderProgress => "intruder_progress",
            Topic::SpiderUrl => "spider_url",
            Topic::SpiderProgress => "spider_progress",
            Topic::ScanProgress => "scan_progress",
        }
    }
}

/// One published event: the topic plus its JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub topic: Topic,
    pub data: serde_json::Value,
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: Event) {
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Receiving half handed to a subscriber. Dropping it closes the queue;
/// the bus reaps closed queues on the next publish to their topics.
pub struct Subscription {
    inner: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Next event, in publish order for each topic. Awaits when empty.
    pub async fn recv(&self) -> Event {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut queue = match self.inner.queue.lock() {
                    Ok(q) => q,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&self) -> Option<Event> {
        match self.inner.queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// How many events overflowed this subscriber's queue so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Topic fan-out. Cheap to clone and share.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    topics: [RwLock<Vec<Arc<SubscriberQueue>>>; Topic::ALL.len()],
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: std::array::from_fn(|_| RwLock::new(Vec::new())),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    fn slot(&self, topic: Topic) -> &RwLock<Vec<Arc<SubscriberQueue>>> {
        let idx = Topic::ALL.iter().position(|t| *t == topic).unwrap_or(0);
        &self.inner.topics[idx]
    }

    /// Register a subscriber for the given topics.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.inner.queue_capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        for topic in topics {
            let mut subs = match self.slot(*topic).write() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            subs.push(queue.clone());
        }
        Subscription { inner: queue }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&Topic::ALL)
    }

    /// Fan an event out to every live subscriber of the topic. Never
    /// blocks on subscribers.
    pub fn publish(&self, topic: Topic, data: serde_json::Value) {
        let event = Event { topic, data };
        let mut saw_closed = false;
        {
            let subs = match self.slot(topic).read() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            for sub in subs.iter() {
                if sub.closed.load(Ordering::Acquire) {
                    saw_closed = true;
                    continue;
                }
                sub.push(event.clone());
            }
        }
        if saw_closed {
            let mut subs = match self.slot(topic).write() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            subs.retain(|s| !s.closed.load(Ordering::Acquire));
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        match self.slot(topic).read() {
            Ok(s) => s.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::default();
        let sub = bus.subscribe(&[Topic::NewRequest]);

        for i in 0..5 {
            bus.publish(Topic::NewRequest, json!({ "seq": i }));
        }
        for i in 0..5 {
            let event = sub.recv().await;
            assert_eq!(event.data["seq"], i);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(3);
        let sub = bus.subscribe(&[Topic::SpiderUrl]);

        for i in 0..5 {
            bus.publish(Topic::SpiderUrl, json!({ "seq": i }));
        }
        assert_eq!(sub.dropped(), 2);
        // Oldest two were discarded: the survivors are a contiguous tail.
        assert_eq!(sub.recv().await.data["seq"], 2);
        assert_eq!(sub.recv().await.data["seq"], 3);
        assert_eq!(sub.recv().await.data["seq"], 4);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let sub = bus.subscribe(&[Topic::IntruderResult]);

        bus.publish(Topic::SpiderProgress, json!({}));
        bus.publish(Topic::IntruderResult, json!({ "hit": true }));

        let event = sub.recv().await;
        assert_eq!(event.topic, Topic::IntruderResult);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn closed_subscribers_are_reaped() {
        let bus = EventBus::default();
        let sub = bus.subscribe(&[Topic::ProxyStatus]);
        assert_eq!(bus.subscriber_count(Topic::ProxyStatus), 1);

        drop(sub);
        bus.publish(Topic::ProxyStatus, json!({}));
        assert_eq!(bus.subscriber_count(Topic::ProxyStatus), 0);
    }

    #[test]
    fn topic_names_match_wire_format() {
        assert_eq!(Topic::NewRequest.as_str(), "new_request");
        assert_eq!(Topic::WebsocketMessage.as_str(), "websocket_message");
        assert_eq!(
            serde_json::to_value(Topic::ScanProgress).unwrap(),
            json!("scan_progress")
        );
    }
}
