use super::types::Event;
use tokio::sync::broadcast;

/// In-process publish/subscribe channel shared by every component.
/// Each subscriber sees every event published after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error: the event is
    /// simply dropped, as with any fire-and-forget emitter.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            tracing::debug!(event = kind, "no subscribers for event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
