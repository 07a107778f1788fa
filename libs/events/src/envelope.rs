//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use labfleet_id::EventId;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human operator or API caller.
    User,
    /// A control loop (controller, scheduler, autoscaler).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    LabInstance,
    Worker,
    WorkerPool,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::LabInstance => "lab_instance",
            AggregateType::Worker => "worker",
            AggregateType::WorkerPool => "worker_pool",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Unique event identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The `namespace/name` of the resource.
    pub aggregate_id: String,

    /// Resource generation the emitter acted on.
    pub generation: i64,

    /// The event type (e.g., "worker.phase_changed").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Identifier of the actor (e.g. "worker-controller").
    pub actor_id: String,

    /// Grouping ID for related events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Erases the payload type so envelopes of different events can share a sink.
    pub fn into_json(self) -> Result<EventEnvelope<serde_json::Value>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            generation: self.generation,
            event_type: self.event_type,
            event_version: self.event_version,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            correlation_id: self.correlation_id,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    generation: i64,
    event_type: Option<String>,
    event_version: i32,
    actor_type: ActorType,
    actor_id: Option<String>,
    correlation_id: Option<String>,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            aggregate_type: None,
            aggregate_id: None,
            generation: 0,
            event_type: None,
            event_version: 1,
            actor_type: ActorType::System,
            actor_id: None,
            correlation_id: None,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn aggregate(mut self, agg_type: AggregateType, agg_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(agg_type);
        self.aggregate_id = Some(agg_id.into());
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// `event_id` defaults to a fresh id and `occurred_at` to now; the
    /// aggregate, event type, actor and payload are required.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            aggregate_type: self
                .aggregate_type
                .ok_or(EventError::MissingField("aggregate_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            generation: self.generation,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            event_version: self.event_version,
            actor_type: self.actor_type,
            actor_id: self.actor_id.ok_or(EventError::MissingField("actor_id"))?,
            correlation_id: self.correlation_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
