// In-process topic bus
//
// Named publish/subscribe channels connecting collectors to the push
// endpoints. Built on tokio broadcast: bounded per-subscriber buffers,
// drop-oldest on overflow. A lagging subscriber keeps its ordering -
// what it receives is always a subsequence of what was published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Topic carrying health samples for /ws/status and /sse/status.
pub const TOPIC_STATUS: &str = "status";
/// Topic carrying access-point batches for /ws/aps and /sse/aps.
pub const TOPIC_APS: &str = "aps";
/// Topic carrying anomaly and geofence alerts.
pub const TOPIC_ALERTS: &str = "alerts";

/// One message on a topic. The payload is the JSON envelope pushed to
/// subscribers verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct TopicMessage {
    pub topic: &'static str,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Many-producer / many-consumer topic bus.
#[derive(Clone)]
pub struct Bus {
    topics: Arc<Mutex<HashMap<&'static str, broadcast::Sender<TopicMessage>>>>,
    capacity: usize,
}

impl Bus {
    /// `capacity` bounds each subscriber's buffer; overflow drops the
    /// oldest undelivered messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &'static str) -> broadcast::Sender<TopicMessage> {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a payload. Returns the number of live subscribers.
    pub fn publish(&self, topic: &'static str, payload: serde_json::Value) -> usize {
        let message = TopicMessage {
            topic,
            timestamp: Utc::now(),
            payload,
        };
        // send only fails when there are no receivers; that is fine
        self.sender(topic).send(message).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: &'static str) -> Subscription {
        Subscription {
            rx: self.sender(topic).subscribe(),
            dropped: 0,
        }
    }
}

/// A live subscription. Tracks how many messages were dropped for this
/// subscriber; the push layer reports the count on disconnect.
pub struct Subscription {
    rx: broadcast::Receiver<TopicMessage>,
    dropped: u64,
}

impl Subscription {
    /// Next message, skipping over any dropped backlog. Returns `None`
    /// once the topic has no more publishers.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::debug!("subscriber lagged, dropped {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Messages lost to drop-oldest so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_order() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe(TOPIC_STATUS);
        for i in 0..5 {
            bus.publish(TOPIC_STATUS, json!({ "seq": i }));
        }
        for i in 0..5 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = Bus::new(4);
        let mut sub = bus.subscribe(TOPIC_APS);
        for i in 0..10 {
            bus.publish(TOPIC_APS, json!({ "seq": i }));
        }
        // The oldest messages are gone; what remains is still in order
        let first = sub.recv().await.unwrap();
        assert!(first.payload["seq"].as_u64().unwrap() >= 6);
        assert!(sub.dropped() > 0);

        let mut prev = first.payload["seq"].as_u64().unwrap();
        while let Ok(Some(msg)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), sub.recv()).await
        {
            let seq = msg.payload["seq"].as_u64().unwrap();
            assert!(seq > prev);
            prev = seq;
        }
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = Bus::new(8);
        let mut status = bus.subscribe(TOPIC_STATUS);
        let mut alerts = bus.subscribe(TOPIC_ALERTS);
        bus.publish(TOPIC_ALERTS, json!({ "kind": "temp" }));
        bus.publish(TOPIC_STATUS, json!({ "cpu": 1.0 }));

        assert_eq!(alerts.recv().await.unwrap().payload["kind"], "temp");
        assert_eq!(status.recv().await.unwrap().payload["cpu"], 1.0);
    }

    #[test]
    fn publish_without_subscribers_is_safe() {
        let bus = Bus::new(8);
        assert_eq!(bus.publish(TOPIC_STATUS, json!({})), 0);
    }
}
