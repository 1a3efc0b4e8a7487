//! Event publication.
//!
//! Workers hand every lifecycle event to an [`EventPublisher`]. The service
//! uses [`BroadcastPublisher`], which fans events out to any number of
//! subscribers; tests use [`RecordingPublisher`] to assert on the exact
//! sequence a worker produced.

use std::sync::Mutex;

use lcm_events::{BlueprintEvent, BlueprintEventType};
use lcm_id::BlueprintId;
use tokio::sync::broadcast;
use tracing::debug;

/// Sink for blueprint events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: BlueprintEvent);
}

/// Fan-out over a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<BlueprintEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlueprintEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: BlueprintEvent) {
        debug!(
            blueprint_id = %event.blueprint_id,
            event_type = %event.event_type,
            "Publishing event"
        );
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<BlueprintEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BlueprintEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Event types published for one blueprint, in order.
    pub fn types_for(&self, id: &BlueprintId) -> Vec<BlueprintEventType> {
        self.events()
            .into_iter()
            .filter(|e| &e.blueprint_id == id)
            .map(|e| e.event_type)
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: BlueprintEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_events::BlueprintStatus;

    fn event(id: BlueprintId, event_type: BlueprintEventType) -> BlueprintEvent {
        BlueprintEvent::new(id, "router", event_type, BlueprintStatus::idle())
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        let id = BlueprintId::new();

        publisher.publish(event(id, BlueprintEventType::StartedDay0));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.blueprint_id, id);
        assert_eq!(received.event_type, BlueprintEventType::StartedDay0);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_fine() {
        let publisher = BroadcastPublisher::new(8);
        publisher.publish(event(BlueprintId::new(), BlueprintEventType::Created));
    }

    #[test]
    fn test_recording_filters_by_blueprint() {
        let publisher = RecordingPublisher::new();
        let a = BlueprintId::new();
        let b = BlueprintId::new();
        publisher.publish(event(a, BlueprintEventType::StartedDay0));
        publisher.publish(event(b, BlueprintEventType::StartedDay0));
        publisher.publish(event(a, BlueprintEventType::Created));

        assert_eq!(
            publisher.types_for(&a),
            vec![BlueprintEventType::StartedDay0, BlueprintEventType::Created]
        );
    }
}
