//! Typed events published by the assigner and the deduction orchestrator.

use crate::recipients::RecipientGroup;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// How a deduced language was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionMethod {
    /// An exact assignment for one of the candidate keys.
    Exact,
    /// The domain-suffix vote.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    AssignmentChanged {
        recipients: RecipientGroup,
        recipients_key: String,
        previous_language: Option<String>,
        language: String,
    },
    AssignmentRemoved {
        recipients_key: String,
        language: String,
    },
    DeductionCompleted {
        recipients: RecipientGroup,
        language: Option<String>,
        method: Option<DeductionMethod>,
        /// Whether the language was pushed to the compose window.
        applied: bool,
    },
    DeductionFailed {
        recipients: RecipientGroup,
        attempts: u32,
    },
    Shutdown,
}

impl Event {
    /// Event name as seen by external listeners.
    pub fn name(&self) -> &'static str {
        match self {
            Event::AssignmentChanged { .. } => "assignment-changed",
            Event::AssignmentRemoved { .. } => "assignment-removed",
            Event::DeductionCompleted { .. } => "deduction-completed",
            Event::DeductionFailed { .. } => "deduction-failed",
            Event::Shutdown => "shutdown",
        }
    }
}

/// Cloneable publishing handle over a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: Event) {
        tracing::debug!("Event: {}", event.name());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every event currently buffered in `receiver`.
pub fn drain(receiver: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
