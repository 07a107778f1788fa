//! Resource model.
//!
//! Every managed object is a [`Resource`]: metadata, a desired-state `spec`
//! and an observed-state `status`. The spec type selects the kind; the status
//! type carries the kind's phase enum and transition table.
//!
//! Invariants:
//! - `status.phase` only changes through [`Resource::transition_to_phase`],
//!   which consults the kind's state machine and leaves the status untouched
//!   on an illegal request.
//! - `spec` only changes through [`Resource::update_spec`], which bumps
//!   `metadata.generation`.

pub mod lab_instance;
pub mod pool;
pub mod worker;

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use labfleet_id::ResourceId;
use labfleet_reconcile::{Phase, SpecHash, StateMachine, TransitionError, TransitionRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use lab_instance::{
    InstanceType, LabInstancePhase, LabInstanceRequest, LabInstanceSpec, LabInstanceStatus,
    ResourceAllocation, ResourceLimits,
};
pub use pool::{
    AllowedHours, PoolCapacitySummary, PoolDesiredState, ScalingConfig, ScalingEvent,
    ScalingPolicy, WorkerPool, WorkerPoolPhase, WorkerPoolSpec, WorkerPoolStatus, WorkerSnapshot,
    WorkerTemplate,
};
pub use worker::{
    CloudInstanceConfig, CloudStatus, HypervisorConfig, HypervisorStatus, Worker, WorkerCapacity,
    WorkerDesiredPhase, WorkerPhase, WorkerSpec, WorkerStatus,
};

/// Label linking a worker to the pool that created it.
pub const POOL_LABEL: &str = "labfleet.io/pool";

/// Label carrying the track a worker or pool serves.
pub const TRACK_LABEL: &str = "labfleet.io/track";

/// Well-known condition types.
pub mod condition_types {
    pub const PHASE_TRANSITION: &str = "PhaseTransition";
    pub const TIMED_OUT: &str = "TimedOut";
    pub const EXTERNAL_ERROR: &str = "ExternalError";
    pub const UNSCHEDULABLE: &str = "Unschedulable";
    pub const WORKER_UNAVAILABLE: &str = "WorkerUnavailable";
    pub const LICENSE_REQUESTED: &str = "LicenseRequested";
    pub const LICENSE_REJECTED: &str = "LicenseRejected";
    pub const HEALTHY: &str = "Healthy";
}

// =============================================================================
// Metadata
// =============================================================================

/// Identity and bookkeeping shared by all kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// `namespace/name`.
    pub id: ResourceId,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Incremented on every spec update.
    pub generation: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            id: ResourceId::new(namespace, name)?,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            generation: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn namespace(&self) -> &str {
        self.id.namespace()
    }

    /// True when every selector entry is present with the same value.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Observed condition, upserted by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: at,
        }
    }
}

/// Insert or replace the condition with the same type.
///
/// Returns false (and keeps the original timestamp) when nothing but the
/// timestamp would change.
pub fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing)
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message =>
        {
            false
        }
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Status fields common to every kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle<P> {
    pub phase: P,

    /// When `phase` was entered; drives per-phase timeouts.
    pub phase_entered_at: Option<DateTime<Utc>>,

    /// Last `metadata.generation` a controller acted upon.
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Observed state of a kind.
pub trait ResourceStatus:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Phase: Phase + Default + Serialize + DeserializeOwned;

    /// The kind's transition table.
    fn state_machine() -> &'static StateMachine<Self::Phase>;

    fn lifecycle(&self) -> &Lifecycle<Self::Phase>;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<Self::Phase>;

    /// Phases in which the controller still has work to drive promptly.
    fn is_transitional(&self) -> bool;
}

/// Desired state of a kind.
pub trait ResourceSpec:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name used in logs and errors.
    const KIND: &'static str;

    type Status: ResourceStatus;

    fn validate(&self) -> Result<(), ValidationError>;
}

/// Phase enum of a spec's kind.
pub type PhaseOf<S> = <<S as ResourceSpec>::Status as ResourceStatus>::Phase;

// =============================================================================
// Envelope
// =============================================================================

/// A managed resource: metadata + spec + status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Resource<S: ResourceSpec> {
    pub metadata: ObjectMeta,
    pub spec: S,
    pub status: S::Status,
}

impl<S: ResourceSpec> Resource<S> {
    /// Create a resource in its initial phase after validating the spec.
    pub fn new(metadata: ObjectMeta, spec: S) -> Result<Self, ValidationError> {
        spec.validate()?;
        let mut status = S::Status::default();
        status.lifecycle_mut().phase_entered_at = Some(metadata.created_at);
        Ok(Self {
            metadata,
            spec,
            status,
        })
    }

    pub fn id(&self) -> &ResourceId {
        &self.metadata.id
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace()
    }

    pub fn phase(&self) -> PhaseOf<S> {
        self.status.lifecycle().phase
    }

    pub fn phase_entered_at(&self) -> DateTime<Utc> {
        self.status
            .lifecycle()
            .phase_entered_at
            .unwrap_or(self.metadata.created_at)
    }

    pub fn is_terminal(&self) -> bool {
        S::Status::state_machine().is_terminal(self.phase())
    }

    pub fn can_transition_to(&self, target: PhaseOf<S>) -> bool {
        S::Status::state_machine().can_transition_to(self.phase(), target)
    }

    /// Move to `target` if the kind's state machine allows it.
    ///
    /// On success the phase, entry time, modification time and the
    /// `PhaseTransition` condition are updated. On failure nothing changes.
    pub fn transition_to_phase(
        &mut self,
        target: PhaseOf<S>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord<PhaseOf<S>>, TransitionError> {
        let record =
            S::Status::state_machine().execute_transition(self.phase(), target, reason, now)?;

        let lifecycle = self.status.lifecycle_mut();
        lifecycle.phase = record.to;
        lifecycle.phase_entered_at = Some(now);
        upsert_condition(
            &mut lifecycle.conditions,
            Condition::new(
                condition_types::PHASE_TRANSITION,
                true,
                record.to.as_str(),
                format!("{} -> {}: {}", record.from, record.to, record.reason),
                now,
            ),
        );
        self.metadata.updated_at = now;

        Ok(record)
    }

    /// Replace the desired state; bumps `generation`.
    pub fn update_spec(&mut self, spec: S, now: DateTime<Utc>) -> Result<(), ValidationError> {
        spec.validate()?;
        self.spec = spec;
        self.metadata.generation += 1;
        self.metadata.updated_at = now;
        Ok(())
    }

    /// Record that the controller has acted on the current generation.
    pub fn mark_observed(&mut self) {
        self.status.lifecycle_mut().observed_generation = self.metadata.generation;
    }

    /// Whether a status-only change warrants running the controller.
    pub fn needs_reconciliation(&self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status.lifecycle().observed_generation < self.metadata.generation
            || self.status.is_transitional()
    }

    /// Hash of the desired state, used for change detection.
    pub fn spec_hash(&self) -> Option<SpecHash> {
        SpecHash::of(&self.spec).ok()
    }

    pub fn set_condition(&mut self, condition: Condition) -> bool {
        upsert_condition(&mut self.status.lifecycle_mut().conditions, condition)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .lifecycle()
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status.lifecycle_mut().error_message = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.status.lifecycle_mut().error_message = None;
    }

    pub fn error_message(&self) -> Option<&str> {
        self.status.lifecycle().error_message.as_deref()
    }
}
