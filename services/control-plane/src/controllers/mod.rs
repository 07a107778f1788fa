//! Resource controllers.
//!
//! A controller executes one reconciliation step per invocation. Each step
//! re-fetches the resource, dispatches on its phase, performs at most a few
//! external calls, and either transitions the phase (saving and publishing
//! an event) or asks to be requeued. Steps never sleep and never return
//! errors: failures are folded into the [`ReconcileResult`] or the status.

mod lab_instance;
mod pool;
mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_events::{
    event_types, ActorType, AggregateType, EventEnvelope, PhaseChangedPayload,
};
use labfleet_id::ResourceId;
use labfleet_reconcile::{phase_timed_out, Phase, ReconcileResult};
use tracing::{debug, error, info, warn};

use crate::clients::{publish_best_effort, EventPublisher};
use crate::error::{ControllerError, ControllerResult};
use crate::resources::{
    LabInstanceSpec, PhaseOf, Resource, ResourceSpec, ResourceStatus, WorkerPoolSpec, WorkerSpec,
};
use crate::store::ResourceStore;

pub use lab_instance::LabInstanceController;
pub use pool::WorkerPoolController;
pub use worker::{WorkerController, WORKER_TAG};

/// One reconciler per resource kind.
#[async_trait]
pub trait Controller<S: ResourceSpec>: Send + Sync {
    /// Name used as the event actor and in logs.
    fn name(&self) -> &'static str;

    /// Advance `resource` by one step toward its desired state.
    async fn reconcile(&self, resource: &Resource<S>) -> ReconcileResult;

    /// Clean up external state of a deleted resource. Idempotent; returns
    /// `true` once nothing is left behind.
    async fn finalize(&self, resource: &Resource<S>) -> bool;
}

/// Per-phase ceilings and requeue delays.
#[derive(Debug, Clone)]
pub struct ControllerTimeouts {
    pub lab_provisioning: Duration,
    pub lab_stopping: Duration,
    pub worker_provisioning_cloud: Duration,
    pub worker_starting: Duration,
    pub worker_licensing: Duration,
    pub worker_stopping: Duration,
    pub worker_terminating: Duration,
    pub pool_initializing: Duration,
    pub pool_scaling: Duration,

    /// Consecutive external failures before a worker is failed.
    pub max_external_errors: u32,

    /// Revisit delay after a transition or while waiting on a quick poll.
    pub poll_interval: Duration,
    /// Revisit delay while a lab boots or shuts down.
    pub lab_poll_interval: Duration,
    /// Revisit delay for unassigned lab requests.
    pub unassigned_requeue: Duration,
    /// Upper bound on any time-based wait.
    pub max_wait: Duration,
    pub steady_requeue: Duration,
    pub retry_requeue: Duration,
}

impl Default for ControllerTimeouts {
    fn default() -> Self {
        Self {
            lab_provisioning: Duration::from_secs(10 * 60),
            lab_stopping: Duration::from_secs(5 * 60),
            worker_provisioning_cloud: Duration::from_secs(10 * 60),
            worker_starting: Duration::from_secs(15 * 60),
            worker_licensing: Duration::from_secs(10 * 60),
            worker_stopping: Duration::from_secs(10 * 60),
            worker_terminating: Duration::from_secs(10 * 60),
            pool_initializing: Duration::from_secs(30 * 60),
            pool_scaling: Duration::from_secs(20 * 60),
            max_external_errors: 5,
            poll_interval: Duration::from_secs(5),
            lab_poll_interval: Duration::from_secs(15),
            unassigned_requeue: Duration::from_secs(10),
            max_wait: Duration::from_secs(60),
            steady_requeue: labfleet_reconcile::DEFAULT_STEADY_REQUEUE,
            retry_requeue: labfleet_reconcile::DEFAULT_RETRY_REQUEUE,
        }
    }
}

/// Event metadata for a kind.
pub trait EventSource: ResourceSpec {
    const AGGREGATE_TYPE: AggregateType;
    const PHASE_CHANGED: &'static str;
}

impl EventSource for LabInstanceSpec {
    const AGGREGATE_TYPE: AggregateType = AggregateType::LabInstance;
    const PHASE_CHANGED: &'static str = event_types::LAB_INSTANCE_PHASE_CHANGED;
}

impl EventSource for WorkerSpec {
    const AGGREGATE_TYPE: AggregateType = AggregateType::Worker;
    const PHASE_CHANGED: &'static str = event_types::WORKER_PHASE_CHANGED;
}

impl EventSource for WorkerPoolSpec {
    const AGGREGATE_TYPE: AggregateType = AggregateType::WorkerPool;
    const PHASE_CHANGED: &'static str = event_types::WORKER_POOL_PHASE_CHANGED;
}

/// Transition, persist, then publish `<kind>.phase_changed`.
///
/// Nothing is saved or published when the transition is illegal.
pub(crate) async fn apply_transition<S: EventSource>(
    store: &dyn ResourceStore<S>,
    events: &dyn EventPublisher,
    actor: &'static str,
    resource: &mut Resource<S>,
    target: PhaseOf<S>,
    reason: &str,
    now: DateTime<Utc>,
) -> ControllerResult<()> {
    let record = resource.transition_to_phase(target, reason, now)?;
    resource.mark_observed();
    store.save(resource).await?;

    info!(
        kind = S::KIND,
        resource = %resource.id(),
        from = %record.from,
        to = %record.to,
        reason = %record.reason,
        "Phase transition"
    );

    publish_best_effort(
        events,
        EventEnvelope::builder()
            .occurred_at(now)
            .aggregate(S::AGGREGATE_TYPE, resource.id().to_string())
            .generation(resource.metadata.generation)
            .event_type(S::PHASE_CHANGED)
            .actor(ActorType::System, actor)
            .payload(PhaseChangedPayload {
                from: record.from.to_string(),
                to: record.to.to_string(),
                reason: record.reason,
            }),
    )
    .await;

    Ok(())
}

/// Record that the current generation has been seen.
pub(crate) async fn observe_generation<S: ResourceSpec>(
    store: &dyn ResourceStore<S>,
    resource: &mut Resource<S>,
) -> ControllerResult<()> {
    if resource.status.lifecycle().observed_generation < resource.metadata.generation {
        resource.mark_observed();
        store.save(resource).await?;
    }
    Ok(())
}

/// Persist `resource` if its status differs from `before`.
pub(crate) async fn save_if_changed<S: ResourceSpec>(
    store: &dyn ResourceStore<S>,
    resource: &Resource<S>,
    before: &S::Status,
) -> ControllerResult<()> {
    if &resource.status != before {
        store.save(resource).await?;
    }
    Ok(())
}

/// Whether the resource has outlived `ceiling` in its current phase.
pub(crate) fn phase_expired<S: ResourceSpec>(
    resource: &Resource<S>,
    ceiling: Duration,
    now: DateTime<Utc>,
) -> Option<ControllerError> {
    phase_timed_out(resource.phase_entered_at(), now, ceiling).then(|| ControllerError::Timeout {
        phase: resource.phase().as_str(),
        limit: ceiling,
    })
}

/// Convert a step's outcome into the result handed to the driver.
pub(crate) fn finish(
    controller: &'static str,
    id: &ResourceId,
    result: ControllerResult<ReconcileResult>,
    retry_after: Duration,
) -> ReconcileResult {
    match result {
        Ok(result) => {
            debug!(
                controller,
                resource = %id,
                success = result.success,
                requeue_after = ?result.requeue_after,
                "Reconcile step complete"
            );
            result
        }
        Err(e @ (ControllerError::External(_) | ControllerError::Store(_))) => {
            warn!(controller, resource = %id, error = %e, "Reconcile step failed; will retry");
            ReconcileResult::retry(e, retry_after)
        }
        Err(e @ ControllerError::Transition(_)) => {
            error!(controller, resource = %id, error = %e, "Illegal transition requested");
            ReconcileResult::failed(e)
        }
        Err(e @ (ControllerError::Validation(_) | ControllerError::Timeout { .. })) => {
            warn!(controller, resource = %id, error = %e, "Reconcile step rejected");
            ReconcileResult::failed(e)
        }
    }
}

/// Requeue delay until `deadline`, capped at `max`.
pub(crate) fn wait_until(deadline: DateTime<Utc>, now: DateTime<Utc>, max: Duration) -> Duration {
    labfleet_reconcile::remaining_until(deadline, now).min(max)
}
