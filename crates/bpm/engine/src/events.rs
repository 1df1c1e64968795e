//! Lifecycle event bus

use bpm_types::{FlowEvent, FlowEventEnvelope};
use tokio::sync::broadcast;

/// Broadcasts lifecycle events to any number of subscribers.
///
/// Callers publish only after the producing transaction has committed.
/// Publishing with no subscribers is not an error; the events are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEventEnvelope> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: FlowEvent) {
        tracing::debug!(event = event.name(), instance_id = %event.instance_id(), "Publishing event");
        let _ = self.sender.send(FlowEventEnvelope::new(event));
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = FlowEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpm_types::FlowInstanceId;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish_all([
            FlowEvent::FlowCompleted {
                instance_id: FlowInstanceId::new("a"),
            },
            FlowEvent::FlowCancelled {
                instance_id: FlowInstanceId::new("b"),
            },
        ]);
        assert_eq!(rx.recv().await.unwrap().event.name(), "FLOW_COMPLETED");
        assert_eq!(rx.recv().await.unwrap().event.name(), "FLOW_CANCELLED");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(FlowEvent::FlowCompleted {
            instance_id: FlowInstanceId::new("a"),
        });
    }
}
