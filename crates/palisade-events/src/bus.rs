//! The broker: publish, subscribe, bounded fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use palisade_core::SubscriberId;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::event::BridgeEvent;
use crate::filter::EventFilter;
use crate::scrub::Scrubber;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A scrubbed event stamped with its bus sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    /// Monotonically increasing, bus-wide.
    pub sequence: u64,
    /// When the bus accepted the event.
    pub received: DateTime<Utc>,
    /// The scrubbed payload.
    pub event: BridgeEvent,
}

struct SubscriberSlot {
    filter: EventFilter,
    sender: mpsc::Sender<Arc<SequencedEvent>>,
}

/// Receiver half of a subscription.
pub struct EventReceiver {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<SequencedEvent>>,
}

impl EventReceiver {
    /// This subscription's id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscription is gone — unsubscribed, or
    /// disconnected by the bus as a slow consumer.
    pub async fn recv(&mut self) -> Option<Arc<SequencedEvent>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<SequencedEvent>> {
        self.receiver.try_recv().ok()
    }
}

/// The event bus.
///
/// Filters are evaluated at publish time per subscriber; delivery is a
/// bounded `try_send` so a slow consumer can never stall the publisher —
/// it gets disconnected instead.
pub struct EventBus {
    subscribers: DashMap<SubscriberId, SubscriberSlot>,
    sequence: AtomicU64,
    scrubber: Scrubber,
    queue_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a bus with the default queue depth.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with the given per-subscriber queue depth.
    #[must_use]
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            sequence: AtomicU64::new(0),
            scrubber: Scrubber::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a subscriber with `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventReceiver {
        let id = SubscriberId::new();
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(id, SubscriberSlot { filter, sender });
        debug!(subscriber = %id, "Subscriber registered");
        EventReceiver { id, receiver }
    }

    /// Remove a subscription. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Publish an event to every matching subscriber.
    ///
    /// The payload is scrubbed once, stamped with the next sequence number,
    /// and cloned by reference into each queue. Returns the number of
    /// subscribers that received it.
    pub fn publish(&self, mut event: BridgeEvent) -> usize {
        self.scrubber.scrub_event(&mut event);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let delivery = Arc::new(SequencedEvent {
            sequence,
            received: Utc::now(),
            event,
        });

        trace!(sequence, event_type = %delivery.event.event_type(), "Publishing event");

        let mut delivered = 0usize;
        let mut slow: Vec<SubscriberId> = Vec::new();

        for entry in &self.subscribers {
            if !entry.filter.matches(&delivery.event) {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&delivery)) {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %entry.key(), "Subscriber queue full — disconnecting slow consumer");
                    slow.push(*entry.key());
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(*entry.key());
                },
            }
        }

        for id in slow {
            self.subscribers.remove(&id);
        }

        delivered
    }

    /// Current number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChatEvent;

    fn chat(room: &str, event_type: &str, body: &str) -> BridgeEvent {
        BridgeEvent::Chat(ChatEvent {
            event_id: "$e".to_owned(),
            room_id: room.to_owned(),
            sender: "@alice:ex".to_owned(),
            event_type: event_type.to_owned(),
            content: serde_json::json!({"msgtype": "m.text", "body": body}),
            origin_server_ts: 0,
        })
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe(EventFilter::all());

        let count = bus.publish(chat("!r1", "m.room.message", "hello"));
        assert_eq!(count, 1);

        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.sequence, 0);
        assert_eq!(delivery.event.room_id(), Some("!r1"));
    }

    #[tokio::test]
    async fn test_filtered_fanout() {
        let bus = EventBus::new();
        let mut by_room = bus.subscribe(EventFilter {
            room_id: Some("!r1".to_owned()),
            ..EventFilter::default()
        });
        let mut by_type = bus.subscribe(EventFilter {
            event_types: Some(vec!["m.room.member".to_owned()]),
            ..EventFilter::default()
        });

        bus.publish(chat("!r1", "m.room.message", "first"));
        bus.publish(chat("!r2", "m.room.member", "second"));

        let a = by_room.recv().await.unwrap();
        assert_eq!(a.event.room_id(), Some("!r1"));
        assert!(by_room.try_recv().is_none());

        let b = by_type.recv().await.unwrap();
        assert_eq!(b.event.event_type(), "m.room.member");
        assert!(by_type.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_sequence_strictly_increasing() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe(EventFilter::all());

        for i in 0..5 {
            bus.publish(chat("!r1", "m.room.message", &format!("m{i}")));
        }

        let mut last = None;
        for _ in 0..5 {
            let delivery = receiver.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(delivery.sequence > prev);
            }
            last = Some(delivery.sequence);
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_disconnected() {
        let bus = EventBus::with_queue_capacity(2);
        let mut receiver = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);

        // Fill the queue, then overflow it.
        bus.publish(chat("!r1", "m.room.message", "1"));
        bus.publish(chat("!r1", "m.room.message", "2"));
        bus.publish(chat("!r1", "m.room.message", "3"));

        assert_eq!(bus.subscriber_count(), 0, "slow consumer must be dropped");

        // The two queued events drain, then the channel reports closed.
        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_payload_scrubbed_before_delivery() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe(EventFilter::all());

        bus.publish(chat("!r1", "m.room.message", "my key sk-abcdef1234567890abcdef"));

        let delivery = receiver.recv().await.unwrap();
        match &delivery.event {
            BridgeEvent::Chat(chat) => {
                let body = chat.body().unwrap();
                assert!(!body.contains("sk-abcdef1234567890abcdef"));
                assert!(body.contains("[REDACTED_KEY]"));
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let receiver = bus.subscribe(EventFilter::all());
        let id = receiver.id();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(chat("!r1", "m.room.message", "x")), 0);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(chat("!r1", "m.room.message", "x")), 0);
    }
}
