//! Outbound event bus.
//!
//! Handlers never call collaborators directly; they publish onto this bus
//! and move on. A slow or absent consumer therefore cannot stall frame
//! processing. Events are dropped if nobody is listening; delivery is the
//! consumer's concern, not the core's.

use shipway_events::PlatformEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Default buffer per subscriber before lagging consumers start losing
/// events.
const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget publisher for [`PlatformEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Never fails; an error from the channel only means
    /// there are currently no subscribers.
    pub fn publish(&self, event: PlatformEvent) {
        let event_type = event.event_type();
        if self.tx.send(event).is_err() {
            debug!(event_type, "No event subscribers; event dropped");
        }
    }

    /// Subscribe to the event stream. Used by the workflow/notification
    /// collaborators (and tests).
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
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
    use shipway_events::{ServerHealthPayload, event_types};
    use shipway_id::{OrgId, ServerId};

    fn sample_event() -> PlatformEvent {
        PlatformEvent::ServerOffline(ServerHealthPayload {
            org_id: OrgId::new(),
            server_id: ServerId::new(),
            server_name: "edge-1".to_string(),
            previous_status: "online".to_string(),
            status: "offline".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), event_types::SERVER_OFFLINE);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // Must not panic or error.
        bus.publish(sample_event());
    }
}
