//! Event bus for broadcasting lifecycle events to receivers.

use std::sync::Arc;

use snaps_core::SnapId;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::event::SnapEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event bus for broadcasting events to all receivers.
///
/// Receivers get events in publish order. Clones of the bus share one
/// channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<SnapEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
        }
    }

    /// Publish an event to all receivers.
    ///
    /// Returns the number of async receivers that received the event.
    pub fn publish(&self, event: SnapEvent) -> usize {
        let event = Arc::new(event);
        trace!(event_type = %event.event_type(), "Publishing event");

        let count = if let Ok(c) = self.sender.send(Arc::clone(&event)) {
            debug!(
                event_type = %event.event_type(),
                receiver_count = c,
                "Event published"
            );
            c
        } else {
            trace!(event_type = %event.event_type(), "No receivers for event");
            0
        };
        count
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), None)
    }

    /// Subscribe to events concerning a single snap.
    #[must_use]
    pub fn subscribe_snap(&self, snap_id: SnapId) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), Some(snap_id))
    }

    /// Current number of receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for events from the event bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<SnapEvent>>,
    snap_filter: Option<SnapId>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Arc<SnapEvent>>, snap_filter: Option<SnapId>) -> Self {
        Self {
            receiver,
            snap_filter,
        }
    }

    fn matches(&self, event: &SnapEvent) -> bool {
        match &self.snap_filter {
            None => true,
            Some(wanted) => event.snap_id() == Some(wanted),
        }
    }

    /// Receive the next matching event.
    ///
    /// Returns `None` once the bus is gone. Lagged events are logged and
    /// skipped.
    pub async fn recv(&mut self) -> Option<Arc<SnapEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next matching event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<SnapEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;

    fn started(id: &str) -> SnapEvent {
        SnapEvent::SnapStarted {
            metadata: EventMetadata::new("test"),
            snap_id: SnapId::from_static(id),
            runtime_id: "rt-1".into(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::new();
        assert_eq!(bus.capacity(), DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(EventBus::with_capacity(8).capacity(), 8);
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver1 = bus.subscribe();
        let mut receiver2 = bus.subscribe();

        assert_eq!(bus.publish(started("npm:a")), 2);

        assert_eq!(receiver1.recv().await.unwrap().event_type(), "snap_started");
        assert_eq!(receiver2.recv().await.unwrap().event_type(), "snap_started");
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(started("npm:a")), 0);
    }

    #[tokio::test]
    async fn test_snap_filtered_subscription() {
        let bus = EventBus::new();
        let mut only_a = bus.subscribe_snap(SnapId::from_static("npm:a"));

        bus.publish(started("npm:b"));
        bus.publish(started("npm:a"));

        let event = only_a.try_recv().unwrap();
        assert_eq!(event.snap_id().unwrap().as_str(), "npm:a");
        assert!(only_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cloned_bus_shares_channel() {
        let bus = EventBus::new();
        let cloned = bus.clone();
        let mut receiver = cloned.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(started("npm:a"));
        assert_eq!(receiver.try_recv().unwrap().event_type(), "snap_started");

        drop(receiver);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
