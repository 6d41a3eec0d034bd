use crate::traits::TelemetryEmitter;
use crate::types::TelemetryEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<TelemetryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TelemetryEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TelemetryEmitter for EventBus {
    fn record(&self, event: TelemetryEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestId;

    #[tokio::test]
    async fn subscribers_receive_recorded_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.record(TelemetryEvent::TraversalStarted {
            request_id: RequestId::from_str("r1"),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "traversal_started");
        assert_eq!(event.request_id().0, "r1");
    }

    #[test]
    fn record_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.record(TelemetryEvent::TraversalStarted {
            request_id: RequestId::new(),
        });
    }
}
