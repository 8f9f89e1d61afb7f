//! Message Bus for operation lifecycle events
//!
//! The scheduler and executors publish lifecycle events here; the CLI and
//! completion notifications subscribe. Subscribers get bounded channels and
//! may subscribe to one event type or to `All`.
//!
//! Publishing never waits on a slow subscriber: an event that does not fit
//! in a subscriber's buffer is dropped for that subscriber only.

use sdk::types::{OperationStatus, PauseReason};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    OperationQueued,
    OperationStarted,
    BatchCompleted,
    OperationPaused,
    OperationResumed,
    OperationCompleted,
    OperationFailed,
    OperationCancelled,
    EmergencyStop,
    CompletionNotice,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    OperationQueued {
        operation_id: String,
        column_id: String,
        awaiting_approval: bool,
    },
    OperationStarted {
        operation_id: String,
        column_id: String,
        total_terms: u64,
    },
    BatchCompleted {
        operation_id: String,
        batch_index: u64,
        total_batches: u64,
        processed_terms: u64,
    },
    OperationPaused {
        operation_id: String,
        reason: PauseReason,
    },
    OperationResumed {
        operation_id: String,
    },
    OperationCompleted {
        operation_id: String,
        successful_terms: u64,
        failed_terms: u64,
        skipped_terms: u64,
        actual_cost: f64,
    },
    OperationFailed {
        operation_id: String,
        reason: String,
    },
    OperationCancelled {
        operation_id: String,
    },
    /// Emergency stop engaged (true) or cleared (false)
    EmergencyStop {
        engaged: bool,
    },
    /// Terminal summary for operations with `notify_on_completion`
    CompletionNotice {
        operation_id: String,
        column_id: String,
        status: OperationStatus,
        summary: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::OperationQueued { .. } => EventType::OperationQueued,
            Event::OperationStarted { .. } => EventType::OperationStarted,
            Event::BatchCompleted { .. } => EventType::BatchCompleted,
            Event::OperationPaused { .. } => EventType::OperationPaused,
            Event::OperationResumed { .. } => EventType::OperationResumed,
            Event::OperationCompleted { .. } => EventType::OperationCompleted,
            Event::OperationFailed { .. } => EventType::OperationFailed,
            Event::OperationCancelled { .. } => EventType::OperationCancelled,
            Event::EmergencyStop { .. } => EventType::EmergencyStop,
            Event::CompletionNotice { .. } => EventType::CompletionNotice,
        }
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to its type's subscribers and to `All` subscribers.
    /// Subscribers whose receiver was dropped are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(?event_type, "Subscriber buffer full, event dropped");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Live subscribers across all event types
    pub async fn subscriber_count(&self) -> usize {
        self.channels.lock().await.values().map(Vec::len).sum()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
