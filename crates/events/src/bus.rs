//! Event bus implementation using tokio broadcast channels

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to evaluation events.
///
/// Clones share the channel, the published counter and the sequence, so
/// every envelope stamped through [`EventBus::emit`] gets a unique,
/// increasing sequence number regardless of which clone sent it.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    event_count: Arc<AtomicUsize>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            event_count: Arc::new(AtomicUsize::new(0)),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap `event` in an envelope with the next sequence number and publish it.
    ///
    /// Returns the envelope that was sent, whether or not anyone listened.
    pub fn emit(&self, event: Event) -> EventEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope::new(event).with_sequence(sequence);
        self.publish(envelope.clone());
        envelope
    }

    /// Publish an already built envelope to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, returns 0 (the event is dropped).
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Events published before subscribing will not be received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn event_count(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Last sequence number handed out by [`EventBus::emit`].
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .field("sequence", &self.current_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task_started() -> Event {
        Event::TaskStarted {
            task_id: Uuid::new_v4(),
            target: "main..feature".to_string(),
            agents: vec!["claude".to_string()],
        }
    }

    #[tokio::test]
    async fn test_emit_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let sent = bus.emit(task_started());
        let received = rx.recv().await.unwrap();

        assert_eq!(received.id, sent.id);
        assert_eq!(received.sequence, 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let envelope = EventEnvelope::new(task_started());
        let envelope_id = envelope.id;
        assert_eq!(bus.publish(envelope), 2);

        assert_eq!(rx1.recv().await.unwrap().id, envelope_id);
        assert_eq!(rx2.recv().await.unwrap().id, envelope_id);
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(EventEnvelope::new(task_started())), 0);
        assert_eq!(bus.event_count(), 1);
    }

    #[tokio::test]
    async fn test_sequence_is_shared_between_clones() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();
        let mut rx = bus1.subscribe();

        bus1.emit(task_started());
        bus2.emit(task_started());
        bus1.emit(task_started());

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(rx.recv().await.unwrap().sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(bus2.current_sequence(), 3);
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        let _rx1 = bus.subscribe();
        let _rx2 = bus.clone().subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
