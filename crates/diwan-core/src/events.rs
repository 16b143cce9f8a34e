//! Domain events and the publisher seam used for notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Represents a domain event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,
    /// Event type (e.g., "request.submitted", "request.completed")
    pub event_type: String,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event with the given type and payload.
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to publish {event_type}: {reason}")]
pub struct PublishError {
    pub event_type: String,
    pub reason: String,
}

/// Sink for domain events. Delivery is fire-and-forget from the caller's
/// point of view: a failed publish never undoes the state change it reports.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: &Event) -> Result<(), PublishError>;
}

/// Publisher that writes every event to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            payload = %event.payload,
            "Event published"
        );
        Ok(())
    }
}

/// Publisher that keeps events in memory, for tests and local tooling.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    events: Mutex<Vec<Event>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event types in publish order.
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
