//! Notifications published by the inference service
//!
//! Collaborators subscribe with [`InferenceService::subscribe`](crate::InferenceService::subscribe)
//! and receive every event sent after subscription. Slow subscribers lose the
//! oldest events rather than blocking the service.

use tokio::sync::broadcast;

/// Event channel capacity; lagging receivers drop the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Typed notifications for the surrounding application
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// The worker process started or stopped
    StateChanged { running: bool },

    /// Human-readable status line
    Log(String),

    /// Outcome of a `load_model` call
    ModelLoaded { success: bool, message: String },

    /// A detect or segment call finished successfully
    DetectionCompleted { count: usize },

    /// A classify call finished successfully
    ClassificationCompleted { top_label: Option<String> },

    /// A keypoint call finished successfully
    KeypointCompleted { count: usize },
}

/// Fan-out of [`ServiceEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn emit(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(ServiceEvent::Log(message.into()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
