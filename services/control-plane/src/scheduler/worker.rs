//! Scheduler background worker.
//!
//! Periodically assigns pending, unassigned lab requests whose window is open
//! to workers. The lab-instance controller takes it from there.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use labfleet_events::{event_types, ActorType, EventEnvelope, LabInstanceScheduledPayload};
use labfleet_id::ResourceId;
use labfleet_reconcile::Clock;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::service::{SchedulingDecision, SchedulingFailure, WorkerSchedulerService};
use crate::clients::{publish_best_effort, EventPublisher};
use crate::controllers::{apply_transition, EventSource};
use crate::error::ControllerResult;
use crate::resources::{
    condition_types, Condition, LabInstancePhase, LabInstanceRequest, LabInstanceSpec, Worker,
};
use crate::store::{LabInstanceStore, StoreError, WorkerPoolStore, WorkerStore};

/// Counts from one scheduling pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulingStats {
    pub pending: usize,
    pub scheduled: usize,
    pub unschedulable: usize,
    pub failed: usize,
}

/// Scheduler worker that runs the placement loop.
pub struct SchedulerWorker {
    labs: Arc<LabInstanceStore>,
    workers: Arc<WorkerStore>,
    pools: Arc<WorkerPoolStore>,
    service: Arc<WorkerSchedulerService>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    namespace: Option<String>,
    interval: Duration,
}

impl SchedulerWorker {
    pub const NAME: &'static str = "scheduler";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        labs: Arc<LabInstanceStore>,
        workers: Arc<WorkerStore>,
        pools: Arc<WorkerPoolStore>,
        service: Arc<WorkerSchedulerService>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        namespace: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            labs,
            workers,
            pools,
            service,
            events,
            clock,
            namespace,
            interval,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            strategy = %self.service.config().strategy,
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(stats) if stats.scheduled > 0 || stats.unschedulable > 0 => {
                            info!(
                                pending = stats.pending,
                                scheduled = stats.scheduled,
                                unschedulable = stats.unschedulable,
                                failed = stats.failed,
                                "Scheduling pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduling pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single scheduling pass.
    pub async fn run_once(&self) -> Result<SchedulingStats, StoreError> {
        let now = self.clock.now();
        let ns = self.namespace.as_deref();

        let mut pending: Vec<LabInstanceRequest> = self
            .labs
            .list(ns, None)
            .await?
            .into_iter()
            .filter(|lab| {
                lab.phase() == LabInstancePhase::Pending
                    && !lab.is_assigned()
                    && lab.window_opens_at() <= now
            })
            .collect();
        pending.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut stats = SchedulingStats {
            pending: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(stats);
        }

        let mut workers = self.workers.list(ns, None).await?;
        let pools = self.pools.list(ns, None).await?;

        for lab in &pending {
            let pooled = lab
                .spec
                .track
                .as_deref()
                .is_some_and(|track| pools.iter().any(|p| p.spec.track == track));
            let result = if pooled {
                self.service.schedule_in_pool(lab, &pools, &workers)
            } else {
                self.service.schedule_lab_instance(lab, &workers)
            };

            match result {
                Ok(decision) => match self.assign(lab.id(), &decision, now).await {
                    Ok(true) => {
                        stats.scheduled += 1;
                        reserve(&mut workers, &decision.worker, lab);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(request = %lab.id(), error = %e, "Failed to record assignment");
                        stats.failed += 1;
                    }
                },
                Err(failure) => {
                    stats.unschedulable += 1;
                    if let Err(e) = self.mark_unschedulable(lab.id(), &failure, now).await {
                        warn!(request = %lab.id(), error = %e, "Failed to record scheduling failure");
                        stats.failed += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Record `decision` on a fresh copy of the request. Returns false when
    /// the request changed underneath and is no longer schedulable.
    async fn assign(
        &self,
        id: &ResourceId,
        decision: &SchedulingDecision,
        now: DateTime<Utc>,
    ) -> ControllerResult<bool> {
        let Some(mut lab) = self.labs.get(id).await? else {
            return Ok(false);
        };
        if !lab.is_schedulable() {
            debug!(request = %id, phase = %lab.phase(), "Request no longer schedulable");
            return Ok(false);
        }

        lab.status.worker_ref = Some(decision.worker.clone());
        lab.status.assigned_at = Some(now);
        lab.set_condition(Condition::new(
            condition_types::UNSCHEDULABLE,
            false,
            "Scheduled",
            format!("assigned to {}", decision.worker),
            now,
        ));

        if lab.phase() == LabInstancePhase::Pending {
            apply_transition(
                self.labs.as_ref(),
                self.events.as_ref(),
                Self::NAME,
                &mut lab,
                LabInstancePhase::Scheduling,
                "worker assigned",
                now,
            )
            .await?;
        } else {
            self.labs.save(&lab).await?;
        }

        info!(
            request = %id,
            worker = %decision.worker,
            score = decision.score,
            latency_us = decision.latency.as_micros() as u64,
            "Lab request scheduled"
        );

        publish_best_effort(
            self.events.as_ref(),
            EventEnvelope::builder()
                .occurred_at(now)
                .aggregate(LabInstanceSpec::AGGREGATE_TYPE, id.to_string())
                .generation(lab.metadata.generation)
                .event_type(event_types::LAB_INSTANCE_SCHEDULED)
                .actor(ActorType::System, Self::NAME)
                .payload(LabInstanceScheduledPayload {
                    worker: decision.worker.to_string(),
                    pool: decision.pool.as_ref().map(ToString::to_string),
                    strategy: decision.strategy.to_string(),
                    score: decision.score,
                    candidates_evaluated: decision.candidates_evaluated,
                    latency_ms: u64::try_from(decision.latency.as_millis()).unwrap_or(u64::MAX),
                }),
        )
        .await;

        Ok(true)
    }

    /// Upsert the `Unschedulable` condition; saves only when it changed.
    async fn mark_unschedulable(
        &self,
        id: &ResourceId,
        failure: &SchedulingFailure,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(mut lab) = self.labs.get(id).await? else {
            return Ok(());
        };
        let changed = lab.set_condition(Condition::new(
            condition_types::UNSCHEDULABLE,
            true,
            failure.reason(),
            failure.to_string(),
            now,
        ));
        if changed {
            debug!(request = %id, reason = failure.reason(), "Lab request unschedulable");
            self.labs.save(&lab).await?;
        }
        Ok(())
    }
}

/// Count the request against the chosen worker for the rest of the pass.
fn reserve(workers: &mut [Worker], worker_id: &ResourceId, lab: &LabInstanceRequest) {
    if let Some(worker) = workers.iter_mut().find(|w| w.id() == worker_id) {
        let capacity = &mut worker.status.capacity;
        capacity.allocated_cpu += lab.spec.resources.cpu_cores;
        capacity.allocated_memory_mb += lab.spec.resources.memory_mb;
        capacity.allocated_storage_gb += lab.spec.resources.storage_gb;
        worker.status.hosted_lab_ids.push(lab.id().to_string());
    }
}
