use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::events::TagEvent;

/// Event bus for in-process fan-out.
///
/// The pipeline publishes CleanRead events here; the admin surface and any
/// downstream forwarders subscribe. Slow subscribers lag and lose events
/// rather than stalling the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TagEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffered capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        info!("EventBus initialized with capacity {}", capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers reached; zero subscribers is not
    /// an error, the event is simply dropped.
    pub fn publish(&self, event: TagEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(_) => {
                debug!("event dropped, no active subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TagEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Shared event bus handle for dependency injection.
pub type SharedEventBus = Arc<EventBus>;
