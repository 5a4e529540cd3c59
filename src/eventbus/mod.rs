//! C6 EventBus: sequenced, topic-addressed fan-out.
//!
//! One `tokio::sync::broadcast` channel per topic, named the way a
//! publish/subscribe layer would (`market:{id}`, `user:{id}`), with a
//! per-topic monotonic `sequence` added so subscribers can detect gaps.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// The wire envelope for every published message: `sequence` increases by
/// exactly 1 per message within a topic, assigned under the same lock as
/// the publish so there is never a gap introduced by the bus itself —
/// only by a slow/disconnected subscriber missing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: i64,
    pub sequence: u64,
    pub last_sequence: u64,
    pub payload: serde_json::Value,
}

struct Topic {
    sender: broadcast::Sender<Envelope>,
    sequence: u64,
}

/// In-process pub/sub with monotonic per-topic sequencing. Cross-process
/// delivery is layered on top by re-publishing each envelope to a message
/// broker connection — omitted here since this crate's scope ends at the
/// in-process contract, but the envelope shape is exactly what would cross
/// that wire unchanged.
#[derive(Default)]
pub struct EventBus {
    topics: DashMap<String, Topic>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> broadcast::Receiver<Envelope> {
        let topic = topic.into();
        self.topics
            .entry(topic)
            .or_insert_with(|| Topic {
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
                sequence: 0,
            })
            .sender
            .subscribe()
    }

    /// Publishes `payload` under `event_type` on `topic`, assigning the next
    /// sequence number. At-least-once within this process: a lagging
    /// subscriber drops the oldest buffered messages rather than blocking
    /// the publisher. This call always happens after a submission's
    /// transaction has committed, never from inside the matching path.
    pub async fn publish(&self, topic: impl Into<String>, event_type: &str, payload: serde_json::Value) {
        let topic = topic.into();
        let mut entry = self.topics.entry(topic.clone()).or_insert_with(|| Topic {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            sequence: 0,
        });
        let last_sequence = entry.sequence;
        entry.sequence += 1;
        let envelope = Envelope {
            topic,
            event_type: event_type.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            sequence: entry.sequence,
            last_sequence,
            payload,
        };
        // No active subscribers is not an error; the snapshot-on-subscribe
        // pattern means a late joiner asks for current state separately.
        let _ = entry.sender.send(envelope);
    }

    pub async fn heartbeat(&self, topic: impl Into<String>) {
        self.publish(topic, "heartbeat", serde_json::Value::Null).await;
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_increases_by_one_per_message() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("market:m1");
        bus.publish("market:m1", "orderbook_update", serde_json::json!({})).await;
        bus.publish("market:m1", "orderbook_update", serde_json::json!({})).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.last_sequence, first.sequence);
    }

    #[tokio::test]
    async fn independent_topics_sequence_independently() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("market:a");
        let mut rx_b = bus.subscribe("market:b");
        bus.publish("market:a", "orderbook_update", serde_json::json!({})).await;
        bus.publish("market:b", "orderbook_update", serde_json::json!({})).await;

        assert_eq!(rx_a.recv().await.unwrap().sequence, 1);
        assert_eq!(rx_b.recv().await.unwrap().sequence, 1);
    }
}
