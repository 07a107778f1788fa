//! Event publishing.
//!
//! Publishing is fire-and-forget: controllers call [`publish_best_effort`],
//! which logs failures and never propagates them.

use std::sync::Mutex;

use async_trait::async_trait;
use labfleet_events::{EventEnvelope, EventEnvelopeBuilder, EventError};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Event sink.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: EventEnvelope<Value>) -> Result<(), EventError>;
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: EventEnvelope<Value>) -> Result<(), EventError> {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            generation = event.generation,
            payload = %event.payload,
            "Event published"
        );
        Ok(())
    }
}

/// Keeps published events in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<EventEnvelope<Value>>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher that rejects every event.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<EventEnvelope<Value>> {
        self.lock().clone()
    }

    /// Events of one type, oldest first.
    pub fn of_type(&self, event_type: &str) -> Vec<EventEnvelope<Value>> {
        self.lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EventEnvelope<Value>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: EventEnvelope<Value>) -> Result<(), EventError> {
        if self.fail {
            return Err(EventError::Publish("recording publisher is failing".to_string()));
        }
        self.lock().push(event);
        Ok(())
    }
}

/// Build and publish an event, logging instead of returning failures.
pub async fn publish_best_effort<P: Serialize>(
    publisher: &dyn EventPublisher,
    builder: EventEnvelopeBuilder<P>,
) {
    let event = match builder.build().and_then(EventEnvelope::into_json) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to build event");
            return;
        }
    };
    let event_type = event.event_type.clone();
    let aggregate_id = event.aggregate_id.clone();
    if let Err(e) = publisher.publish(event).await {
        warn!(
            event_type = %event_type,
            aggregate_id = %aggregate_id,
            error = %e,
            "Failed to publish event"
        );
    }
}
