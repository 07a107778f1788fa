//! WorkerPool controller.
//!
//! Every tick re-reads the pool's workers, garbage-collects the ones that
//! reached TERMINATED, and refreshes the status aggregates before
//! dispatching on phase. Workers are created and retired one per tick.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_events::{
    event_types, ActorType, EventEnvelope, ScaleDirection, WorkerPoolScaledPayload,
};
use labfleet_id::ResourceId;
use labfleet_reconcile::{select_for_drain, Clock, DrainPriority, ReconcileResult};
use tracing::{debug, info, instrument, warn};

use super::{
    apply_transition, finish, observe_generation, phase_expired, save_if_changed, Controller,
    ControllerTimeouts, EventSource,
};
use crate::clients::{publish_best_effort, EventPublisher};
use crate::error::ControllerResult;
use crate::resources::{
    condition_types, Condition, Worker, WorkerDesiredPhase, WorkerPhase, WorkerPool,
    WorkerPoolPhase, WorkerPoolSpec, WorkerPoolStatus,
};
use crate::scaling::{Autoscaler, ScaleDecision};
use crate::store::{WorkerPoolStore, WorkerStore};

pub struct WorkerPoolController {
    pools: Arc<WorkerPoolStore>,
    workers: Arc<WorkerStore>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    timeouts: ControllerTimeouts,
}

/// Drain order for scale-down: failed first, then not-ready, idle, loaded.
pub fn drain_priority(worker: &Worker) -> DrainPriority {
    if worker.phase() == WorkerPhase::Failed {
        DrainPriority::Failed
    } else if !worker.is_ready() {
        DrainPriority::NotReady
    } else if worker.hosted_labs() == 0 {
        DrainPriority::Idle
    } else {
        DrainPriority::Busy
    }
}

impl WorkerPoolController {
    pub const NAME: &'static str = "worker-pool-controller";

    pub fn new(
        pools: Arc<WorkerPoolStore>,
        workers: Arc<WorkerStore>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        timeouts: ControllerTimeouts,
    ) -> Self {
        Self {
            pools,
            workers,
            events,
            clock,
            timeouts,
        }
    }

    async fn transition(
        &self,
        pool: &mut WorkerPool,
        target: WorkerPoolPhase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        apply_transition(
            self.pools.as_ref(),
            self.events.as_ref(),
            Self::NAME,
            pool,
            target,
            reason,
            now,
        )
        .await
    }

    async fn advance(
        &self,
        pool: &mut WorkerPool,
        target: WorkerPoolPhase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        self.transition(pool, target, reason, now).await?;
        Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
    }

    /// Member workers, oldest first by name.
    async fn members(&self, pool: &WorkerPool) -> ControllerResult<Vec<Worker>> {
        Ok(self
            .workers
            .list(Some(pool.namespace()), Some(&pool.worker_selector()))
            .await?)
    }

    /// Delete members that finished terminating; returns the rest.
    async fn collect_terminated(&self, workers: Vec<Worker>) -> ControllerResult<Vec<Worker>> {
        let mut live = Vec::with_capacity(workers.len());
        for worker in workers {
            if worker.phase() == WorkerPhase::Terminated {
                info!(worker = %worker.id(), "Removing terminated worker");
                self.workers.delete(worker.id()).await?;
            } else {
                live.push(worker);
            }
        }
        Ok(live)
    }

    /// Mark FAILED members for termination so they stop counting toward the
    /// pool size and a replacement can be created.
    async fn retire_failed(
        &self,
        pool: &WorkerPool,
        workers: Vec<Worker>,
        now: DateTime<Utc>,
    ) -> ControllerResult<Vec<Worker>> {
        let mut members = Vec::with_capacity(workers.len());
        for mut worker in workers {
            if worker.phase() == WorkerPhase::Failed && !worker.marked_for_termination() {
                let mut spec = worker.spec.clone();
                spec.desired_phase = WorkerDesiredPhase::Terminated;
                worker.update_spec(spec, now)?;
                self.workers.save(&worker).await?;
                warn!(resource = %pool.id(), worker = %worker.id(), "Retiring failed worker");
            }
            members.push(worker);
        }
        Ok(members)
    }

    async fn step(&self, id: &ResourceId) -> ControllerResult<ReconcileResult> {
        let Some(mut pool) = self.pools.get(id).await? else {
            debug!(resource = %id, "Worker pool no longer exists");
            return Ok(ReconcileResult::done());
        };
        if pool.is_terminal() {
            return Ok(ReconcileResult::done());
        }
        observe_generation(self.pools.as_ref(), &mut pool).await?;
        let now = self.clock.now();
        let before = pool.status.clone();

        let workers = self.members(&pool).await?;
        let workers = self.collect_terminated(workers).await?;
        let workers = if pool.marked_for_termination() {
            workers
        } else {
            self.retire_failed(&pool, workers, now).await?
        };
        pool.refresh_from_workers(&workers);

        if pool.marked_for_termination()
            && matches!(
                pool.phase(),
                WorkerPoolPhase::Pending
                    | WorkerPoolPhase::Initializing
                    | WorkerPoolPhase::Ready
                    | WorkerPoolPhase::ScalingUp
                    | WorkerPoolPhase::ScalingDown
                    | WorkerPoolPhase::Failed
            )
        {
            return self
                .advance(&mut pool, WorkerPoolPhase::Draining, "termination requested", now)
                .await;
        }

        match pool.phase() {
            WorkerPoolPhase::Pending => {
                self.advance(&mut pool, WorkerPoolPhase::Initializing, "pool created", now)
                    .await
            }
            WorkerPoolPhase::Initializing => {
                self.reconcile_initializing(&mut pool, &before, now).await
            }
            WorkerPoolPhase::Ready => self.reconcile_ready(&mut pool, &workers, &before, now).await,
            WorkerPoolPhase::ScalingUp => {
                if let Some(e) = phase_expired(&pool, self.timeouts.pool_scaling, now) {
                    return self.fail(&mut pool, &e.to_string(), now).await;
                }
                let provisioning = workers
                    .iter()
                    .any(|w| !w.marked_for_termination() && w.phase().is_provisioning());
                if provisioning {
                    save_if_changed(self.pools.as_ref(), &pool, &before).await?;
                    Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
                } else {
                    self.advance(&mut pool, WorkerPoolPhase::Ready, "new worker is up", now)
                        .await
                }
            }
            WorkerPoolPhase::ScalingDown => {
                if let Some(e) = phase_expired(&pool, self.timeouts.pool_scaling, now) {
                    return self.fail(&mut pool, &e.to_string(), now).await;
                }
                let retiring = workers.iter().any(|w| w.marked_for_termination());
                if retiring {
                    save_if_changed(self.pools.as_ref(), &pool, &before).await?;
                    Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
                } else {
                    self.advance(&mut pool, WorkerPoolPhase::Ready, "worker retired", now)
                        .await
                }
            }
            WorkerPoolPhase::Draining => {
                let hosted = pool.status.capacity.total_hosted_labs;
                if hosted == 0 {
                    self.advance(&mut pool, WorkerPoolPhase::Terminating, "pool drained", now)
                        .await
                } else {
                    debug!(resource = %pool.id(), hosted, "Waiting for pool to drain");
                    save_if_changed(self.pools.as_ref(), &pool, &before).await?;
                    Ok(ReconcileResult::requeue(self.timeouts.steady_requeue))
                }
            }
            WorkerPoolPhase::Terminating => {
                for worker in &workers {
                    self.workers.delete(worker.id()).await?;
                }
                info!(resource = %pool.id(), deleted = workers.len(), "Deleted pool workers");
                pool.refresh_from_workers(&[]);
                self.transition(&mut pool, WorkerPoolPhase::Terminated, "workers deleted", now)
                    .await?;
                Ok(ReconcileResult::done())
            }
            WorkerPoolPhase::Failed | WorkerPoolPhase::Terminated => {
                save_if_changed(self.pools.as_ref(), &pool, &before).await?;
                Ok(ReconcileResult::done())
            }
        }
    }

    async fn reconcile_initializing(
        &self,
        pool: &mut WorkerPool,
        before: &WorkerPoolStatus,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(pool, self.timeouts.pool_initializing, now) {
            return self.fail(pool, &e.to_string(), now).await;
        }

        let wanted = pool.spec.scaling.min_workers.max(1);
        let current = pool.status.capacity.current_workers;
        if current < wanted {
            let worker = self.create_worker(pool, now).await?;
            debug!(resource = %pool.id(), worker = %worker.id(), current, wanted, "Created initial worker");
            self.pools.save(pool).await?;
            return Ok(ReconcileResult::requeue(self.timeouts.poll_interval));
        }

        if pool.status.ready_workers > 0 {
            return self
                .advance(pool, WorkerPoolPhase::Ready, "initial workers ready", now)
                .await;
        }

        save_if_changed(self.pools.as_ref(), pool, before).await?;
        Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
    }

    async fn reconcile_ready(
        &self,
        pool: &mut WorkerPool,
        workers: &[Worker],
        before: &WorkerPoolStatus,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let decision = Autoscaler::new(&pool.spec.scaling).decide(&pool.status, now);

        match decision {
            ScaleDecision::Hold => {
                save_if_changed(self.pools.as_ref(), pool, before).await?;
                Ok(ReconcileResult::requeue(self.timeouts.steady_requeue))
            }
            ScaleDecision::Scale {
                direction: ScaleDirection::Up,
                from,
                to,
                reason,
            } => {
                let worker = self.create_worker(pool, now).await?;
                let name = worker.name().to_string();
                self.record_scale(pool, ScaleDirection::Up, from, to, &reason, name, now)
                    .await;
                self.advance(pool, WorkerPoolPhase::ScalingUp, &reason, now)
                    .await
            }
            ScaleDecision::Scale {
                direction: ScaleDirection::Down,
                from,
                to,
                reason,
            } => {
                let mut candidates: Vec<Worker> = workers
                    .iter()
                    .filter(|w| !w.marked_for_termination())
                    .cloned()
                    .collect();
                candidates.sort_by(|a, b| a.name().cmp(b.name()));
                let Some(mut victim) = select_for_drain(candidates, drain_priority)
                    .into_iter()
                    .next()
                else {
                    warn!(resource = %pool.id(), "No worker available to retire");
                    save_if_changed(self.pools.as_ref(), pool, before).await?;
                    return Ok(ReconcileResult::requeue(self.timeouts.steady_requeue));
                };

                let mut spec = victim.spec.clone();
                spec.desired_phase = WorkerDesiredPhase::Terminated;
                victim.update_spec(spec, now)?;
                self.workers.save(&victim).await?;
                info!(resource = %pool.id(), worker = %victim.id(), reason = %reason, "Retiring worker");

                let name = victim.name().to_string();
                self.record_scale(pool, ScaleDirection::Down, from, to, &reason, name, now)
                    .await;
                self.advance(pool, WorkerPoolPhase::ScalingDown, &reason, now)
                    .await
            }
        }
    }

    async fn create_worker(
        &self,
        pool: &WorkerPool,
        now: DateTime<Utc>,
    ) -> ControllerResult<Worker> {
        let worker = pool.new_worker(now)?;
        self.workers.save(&worker).await?;
        info!(resource = %pool.id(), worker = %worker.id(), "Created worker");
        Ok(worker)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_scale(
        &self,
        pool: &mut WorkerPool,
        direction: ScaleDirection,
        from: u32,
        to: u32,
        reason: &str,
        worker: String,
        now: DateTime<Utc>,
    ) {
        let event = pool.scaling_event(direction, from, to, reason, Some(worker.clone()), now);
        pool.status.record_scaling_event(event);

        publish_best_effort(
            self.events.as_ref(),
            EventEnvelope::builder()
                .occurred_at(now)
                .aggregate(WorkerPoolSpec::AGGREGATE_TYPE, pool.id().to_string())
                .generation(pool.metadata.generation)
                .event_type(event_types::WORKER_POOL_SCALED)
                .actor(ActorType::System, Self::NAME)
                .payload(WorkerPoolScaledPayload {
                    direction,
                    from_workers: from,
                    to_workers: to,
                    reason: reason.to_string(),
                    worker,
                }),
        )
        .await;
    }

    async fn fail(
        &self,
        pool: &mut WorkerPool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        pool.set_error(reason);
        pool.set_condition(Condition::new(
            condition_types::TIMED_OUT,
            true,
            "PhaseTimeout",
            reason,
            now,
        ));
        self.transition(pool, WorkerPoolPhase::Failed, reason, now)
            .await?;
        Ok(ReconcileResult::failed(reason))
    }
}

#[async_trait]
impl Controller<WorkerPoolSpec> for WorkerPoolController {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip(self, resource), fields(resource = %resource.id()))]
    async fn reconcile(&self, resource: &WorkerPool) -> ReconcileResult {
        let result = self.step(resource.id()).await;
        finish(Self::NAME, resource.id(), result, self.timeouts.retry_requeue)
    }

    /// Deletes every member; their own finalizers release the instances.
    #[instrument(skip(self, resource), fields(resource = %resource.id()))]
    async fn finalize(&self, resource: &WorkerPool) -> bool {
        let workers = match self.members(resource).await {
            Ok(workers) => workers,
            Err(e) => {
                warn!(resource = %resource.id(), error = %e, "Failed to list pool workers");
                return false;
            }
        };

        let mut clean = true;
        for worker in &workers {
            if let Err(e) = self.workers.delete(worker.id()).await {
                warn!(worker = %worker.id(), error = %e, "Failed to delete pool worker");
                clean = false;
            }
        }
        if clean {
            info!(resource = %resource.id(), deleted = workers.len(), "Worker pool finalized");
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::RecordingPublisher;
    use crate::resources::pool::tests::pool_spec;
    use crate::resources::{ObjectMeta, WorkerCapacity};
    use crate::store::{InMemoryStore, ResourceStore};
    use chrono::TimeZone;
    use labfleet_reconcile::ManualClock;

    struct Harness {
        pools: Arc<InMemoryStore<WorkerPoolSpec>>,
        workers: Arc<InMemoryStore<crate::resources::WorkerSpec>>,
        events: Arc<RecordingPublisher>,
        clock: Arc<ManualClock>,
        controller: WorkerPoolController,
    }

    fn harness() -> Harness {
        let pools: Arc<InMemoryStore<WorkerPoolSpec>> = Arc::new(InMemoryStore::new());
        let workers: Arc<InMemoryStore<crate::resources::WorkerSpec>> =
            Arc::new(InMemoryStore::new());
        let events = Arc::new(RecordingPublisher::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let controller = WorkerPoolController::new(
            pools.clone(),
            workers.clone(),
            events.clone(),
            clock.clone(),
            ControllerTimeouts::default(),
        );
        Harness {
            pools,
            workers,
            events,
            clock,
            controller,
        }
    }

    async fn seed_pool(h: &Harness) -> WorkerPool {
        let meta = ObjectMeta::new("pools", "ccna", h.clock.now()).unwrap();
        let pool = WorkerPool::new(meta, pool_spec("ccna")).unwrap();
        h.pools.save(&pool).await.unwrap();
        pool
    }

    async fn tick(h: &Harness, pool: &WorkerPool) -> WorkerPool {
        h.controller.reconcile(pool).await;
        h.pools.get(pool.id()).await.unwrap().unwrap()
    }

    /// Force every member into `phase` with the given load.
    async fn set_members(h: &Harness, phase: WorkerPhase, cpu_used: f64, labs: usize) {
        for mut worker in h.workers.list(None, None).await.unwrap() {
            worker.status.lifecycle.phase = phase;
            worker.status.capacity = WorkerCapacity {
                total_cpu: 32.0,
                allocated_cpu: cpu_used,
                total_memory_mb: 131_072,
                allocated_memory_mb: 0,
                total_storage_gb: 1000,
                allocated_storage_gb: 0,
                max_concurrent_labs: 20,
            };
            worker.status.hosted_lab_ids = (0..labs).map(|i| format!("lab-{i}")).collect();
            h.workers.save(&worker).await.unwrap();
        }
    }

    fn worker_in(phase: WorkerPhase, labs: usize) -> Worker {
        let meta = ObjectMeta::new("pools", "w-1", Utc::now()).unwrap();
        let mut worker =
            Worker::create(meta, crate::resources::worker::tests::worker_spec("ccna")).unwrap();
        worker.status.lifecycle.phase = phase;
        worker.status.hosted_lab_ids = (0..labs).map(|i| format!("lab-{i}")).collect();
        worker
    }

    #[test]
    fn test_drain_priority() {
        assert_eq!(drain_priority(&worker_in(WorkerPhase::Failed, 0)), DrainPriority::Failed);
        assert_eq!(drain_priority(&worker_in(WorkerPhase::Starting, 0)), DrainPriority::NotReady);
        assert_eq!(drain_priority(&worker_in(WorkerPhase::Ready, 0)), DrainPriority::Idle);
        assert_eq!(drain_priority(&worker_in(WorkerPhase::Active, 2)), DrainPriority::Busy);
    }

    #[tokio::test]
    async fn test_initializes_then_scales_up_under_load() {
        let h = harness();
        let pool = seed_pool(&h).await;

        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Initializing);

        let pool = tick(&h, &pool).await;
        assert_eq!(h.workers.len().await, 1);
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Initializing);
        assert_eq!(h.workers.len().await, 1);

        set_members(&h, WorkerPhase::Active, 30.0, 1).await;
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Ready);
        assert_eq!(pool.status.ready_workers, 1);

        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::ScalingUp);
        assert_eq!(h.workers.len().await, 2);
        assert_eq!(pool.status.scaling_events.len(), 1);
        assert_eq!(pool.status.last_scale_up_at, Some(h.clock.now()));
        assert_eq!(h.events.of_type(event_types::WORKER_POOL_SCALED).len(), 1);

        // The new worker is still provisioning.
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::ScalingUp);

        set_members(&h, WorkerPhase::Ready, 1.0, 0).await;
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Ready);
    }

    #[tokio::test]
    async fn test_scale_down_retires_idle_worker() {
        let h = harness();
        let mut pool = seed_pool(&h).await;
        for _ in 0..2 {
            let worker = pool.new_worker(h.clock.now()).unwrap();
            h.workers.save(&worker).await.unwrap();
        }
        set_members(&h, WorkerPhase::Ready, 0.0, 0).await;
        pool.transition_to_phase(WorkerPoolPhase::Initializing, "test", h.clock.now())
            .unwrap();
        pool.transition_to_phase(WorkerPoolPhase::Ready, "test", h.clock.now())
            .unwrap();
        h.pools.save(&pool).await.unwrap();

        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::ScalingDown);
        let marked: Vec<_> = h
            .workers
            .list(None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|w| w.marked_for_termination())
            .collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].metadata.generation, 2);

        // Retired worker finishes terminating and is collected.
        let mut retired = marked[0].clone();
        retired.status.lifecycle.phase = WorkerPhase::Terminated;
        h.workers.save(&retired).await.unwrap();

        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Ready);
        assert_eq!(h.workers.len().await, 1);

        // Idle, but already at min_workers.
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Ready);
    }

    #[tokio::test]
    async fn test_termination_waits_for_labs_then_deletes_workers() {
        let h = harness();
        let mut pool = seed_pool(&h).await;
        let worker = pool.new_worker(h.clock.now()).unwrap();
        h.workers.save(&worker).await.unwrap();
        set_members(&h, WorkerPhase::Active, 4.0, 1).await;

        let mut spec = pool.spec.clone();
        spec.desired_state = crate::resources::PoolDesiredState::Terminated;
        pool.update_spec(spec, h.clock.now()).unwrap();
        h.pools.save(&pool).await.unwrap();

        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Draining);
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Draining);

        set_members(&h, WorkerPhase::Ready, 0.0, 0).await;
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Terminating);
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Terminated);
        assert!(h.workers.is_empty().await);
    }

    #[tokio::test]
    async fn test_initializing_times_out() {
        let h = harness();
        let pool = seed_pool(&h).await;
        let pool = tick(&h, &pool).await;
        let pool = tick(&h, &pool).await;

        h.clock.advance(std::time::Duration::from_secs(31 * 60));
        let pool = tick(&h, &pool).await;
        assert_eq!(pool.phase(), WorkerPoolPhase::Failed);
        assert!(pool.condition(condition_types::TIMED_OUT).is_some());
    }

    #[tokio::test]
    async fn test_failed_member_at_max_is_replaced() {
        let h = harness();
        let mut pool = seed_pool(&h).await;
        let mut spec = pool.spec.clone();
        spec.scaling.min_workers = 1;
        spec.scaling.max_workers = 1;
        pool.update_spec(spec, h.clock.now()).unwrap();
        let worker = pool.new_worker(h.clock.now()).unwrap();
        h.workers.save(&worker).await.unwrap();
        set_members(&h, WorkerPhase::Failed, 0.0, 0).await;
        pool.transition_to_phase(WorkerPoolPhase::Initializing, "test", h.clock.now())
            .unwrap();
        pool.transition_to_phase(WorkerPoolPhase::Ready, "test", h.clock.now())
            .unwrap();
        h.pools.save(&pool).await.unwrap();

        // The failed member stops counting, so the pool is below min_workers.
        let pool = tick(&h, &pool).await;
        let failed = h.workers.get(worker.id()).await.unwrap().unwrap();
        assert!(failed.marked_for_termination());
        assert_eq!(pool.phase(), WorkerPoolPhase::ScalingUp);
        assert_eq!(h.workers.len().await, 2);
    }

    #[tokio::test]
    async fn test_finalize_deletes_members() {
        let h = harness();
        let pool = seed_pool(&h).await;
        for _ in 0..3 {
            h.workers
                .save(&pool.new_worker(h.clock.now()).unwrap())
                .await
                .unwrap();
        }
        assert!(h.controller.finalize(&pool).await);
        assert!(h.workers.is_empty().await);

        h.workers.set_unavailable(true);
        assert!(!h.controller.finalize(&pool).await);
    }
}
