//! LabInstanceRequest controller.
//!
//! PENDING waits for the schedule window and a worker assignment, then
//! PROVISIONING creates and boots the lab on the worker's hypervisor,
//! RUNNING watches it until the requested duration elapses, and STOPPING
//! tears it down.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_id::ResourceId;
use labfleet_reconcile::{Clock, ReconcileResult};
use tracing::{debug, info, instrument, warn};

use super::{
    apply_transition, finish, observe_generation, phase_expired, wait_until, Controller,
    ControllerTimeouts,
};
use crate::clients::{EventPublisher, HypervisorSession, LabState, SessionManager};
use crate::error::{ControllerResult, ExternalError};
use crate::resources::{
    condition_types, Condition, LabInstancePhase, LabInstanceRequest, LabInstanceSpec,
    ResourceAllocation, Worker,
};
use crate::store::{LabInstanceStore, WorkerStore};

pub struct LabInstanceController {
    labs: Arc<LabInstanceStore>,
    workers: Arc<WorkerStore>,
    sessions: Arc<SessionManager>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    timeouts: ControllerTimeouts,
}

impl LabInstanceController {
    pub const NAME: &'static str = "lab-instance-controller";

    pub fn new(
        labs: Arc<LabInstanceStore>,
        workers: Arc<WorkerStore>,
        sessions: Arc<SessionManager>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        timeouts: ControllerTimeouts,
    ) -> Self {
        Self {
            labs,
            workers,
            sessions,
            events,
            clock,
            timeouts,
        }
    }

    async fn transition(
        &self,
        lab: &mut LabInstanceRequest,
        target: LabInstancePhase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        apply_transition(
            self.labs.as_ref(),
            self.events.as_ref(),
            Self::NAME,
            lab,
            target,
            reason,
            now,
        )
        .await
    }

    async fn step(&self, id: &ResourceId) -> ControllerResult<ReconcileResult> {
        let Some(mut lab) = self.labs.get(id).await? else {
            debug!(resource = %id, "Lab instance no longer exists");
            return Ok(ReconcileResult::done());
        };
        observe_generation(self.labs.as_ref(), &mut lab).await?;
        let now = self.clock.now();

        match lab.phase() {
            LabInstancePhase::Pending | LabInstancePhase::Scheduling => {
                self.reconcile_pending(&mut lab, now).await
            }
            LabInstancePhase::Provisioning => self.reconcile_provisioning(&mut lab, now).await,
            LabInstancePhase::Running => self.reconcile_running(&mut lab, now).await,
            LabInstancePhase::Stopping => self.reconcile_stopping(&mut lab, now).await,
            LabInstancePhase::Completed | LabInstancePhase::Failed | LabInstancePhase::Expired => {
                Ok(ReconcileResult::done())
            }
        }
    }

    async fn reconcile_pending(
        &self,
        lab: &mut LabInstanceRequest,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(start) = lab.spec.scheduled_start {
            if start > now {
                return Ok(ReconcileResult::requeue(wait_until(
                    start,
                    now,
                    self.timeouts.max_wait,
                )));
            }
        }

        let Some(worker_ref) = lab.status.worker_ref.clone() else {
            if now >= lab.window_closes_at() {
                self.transition(lab, LabInstancePhase::Expired, "scheduled window elapsed", now)
                    .await?;
                return Ok(ReconcileResult::done());
            }
            return Ok(ReconcileResult::requeue(self.timeouts.unassigned_requeue));
        };

        match self.workers.get(&worker_ref).await? {
            Some(worker) if worker.is_ready() && !worker.marked_for_termination() => {
                let limits = lab.spec.resources;
                lab.status.allocation = Some(ResourceAllocation {
                    cpu_cores: limits.cpu_cores,
                    memory_mb: limits.memory_mb,
                    storage_gb: limits.storage_gb,
                    allocated_at: now,
                });
                if lab.condition(condition_types::WORKER_UNAVAILABLE).is_some() {
                    lab.set_condition(Condition::new(
                        condition_types::WORKER_UNAVAILABLE,
                        false,
                        "WorkerAvailable",
                        format!("worker {worker_ref} is {}", worker.phase()),
                        now,
                    ));
                }
                let reason = format!("assigned to worker {worker_ref}");
                self.transition(lab, LabInstancePhase::Provisioning, &reason, now)
                    .await?;
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
            other => {
                let message = match other {
                    Some(worker) => format!("worker {worker_ref} is {}", worker.phase()),
                    None => format!("worker {worker_ref} no longer exists"),
                };
                info!(resource = %lab.id(), reason = %message, "Releasing worker assignment");

                lab.status.worker_ref = None;
                lab.status.assigned_at = None;
                lab.set_condition(Condition::new(
                    condition_types::WORKER_UNAVAILABLE,
                    true,
                    "WorkerUnavailable",
                    message.as_str(),
                    now,
                ));
                if lab.phase() == LabInstancePhase::Scheduling {
                    self.transition(lab, LabInstancePhase::Pending, &message, now)
                        .await?;
                } else {
                    self.labs.save(lab).await?;
                }
                Ok(ReconcileResult::requeue(self.timeouts.unassigned_requeue))
            }
        }
    }

    async fn reconcile_provisioning(
        &self,
        lab: &mut LabInstanceRequest,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(lab, self.timeouts.lab_provisioning, now) {
            return self.fail(lab, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }

        let Some(worker) = self.assigned_worker(lab).await? else {
            return self
                .fail(lab, condition_types::WORKER_UNAVAILABLE, "assigned worker no longer exists", now)
                .await;
        };
        let session = self.sessions.for_worker(&worker).await?;
        let client = self.sessions.client();

        let lab_id = match lab.status.lab_id.clone() {
            Some(lab_id) => lab_id,
            None => {
                let info = self.sessions.checked(
                    &session,
                    client
                        .create_lab(&session, &lab.spec.template, lab.name())
                        .await,
                )?;
                info!(resource = %lab.id(), lab_id = %info.id, worker = %worker.id(), "Created lab");
                lab.status.lab_id = Some(info.id.clone());
                lab.metadata.updated_at = now;
                // The id must be durable before the lab is started.
                self.labs.save(lab).await?;
                info.id
            }
        };

        let current = self
            .sessions
            .checked(&session, client.get_lab(&session, &lab_id).await)?;
        let Some(info) = current else {
            warn!(resource = %lab.id(), lab_id = %lab_id, "Lab vanished during provisioning; recreating");
            lab.status.lab_id = None;
            self.labs.save(lab).await?;
            return Ok(ReconcileResult::requeue(self.timeouts.poll_interval));
        };

        match info.state {
            LabState::Defined | LabState::Stopped => {
                self.sessions
                    .checked(&session, client.start_lab(&session, &lab_id).await)?;
                debug!(resource = %lab.id(), lab_id = %lab_id, "Started lab");
                Ok(ReconcileResult::requeue(self.timeouts.lab_poll_interval))
            }
            LabState::Starting => Ok(ReconcileResult::requeue(self.timeouts.lab_poll_interval)),
            LabState::Booted => {
                lab.status.started_at = Some(now);
                lab.clear_error();
                self.transition(lab, LabInstancePhase::Running, "lab booted", now)
                    .await?;
                let ends_at = now + lab.spec.duration();
                Ok(ReconcileResult::requeue(wait_until(
                    ends_at,
                    now,
                    self.timeouts.max_wait,
                )))
            }
            LabState::Failed => {
                self.fail(lab, condition_types::EXTERNAL_ERROR, "lab failed to boot", now)
                    .await
            }
        }
    }

    async fn reconcile_running(
        &self,
        lab: &mut LabInstanceRequest,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let ends_at = lab
            .run_ends_at()
            .unwrap_or_else(|| lab.phase_entered_at() + lab.spec.duration());
        if ends_at <= now {
            self.transition(lab, LabInstancePhase::Stopping, "duration elapsed", now)
                .await?;
            return Ok(ReconcileResult::requeue(self.timeouts.poll_interval));
        }

        let Some(worker) = self.assigned_worker(lab).await? else {
            return self
                .fail(lab, condition_types::WORKER_UNAVAILABLE, "worker hosting the lab no longer exists", now)
                .await;
        };
        let Some(lab_id) = lab.status.lab_id.clone() else {
            return self
                .fail(lab, condition_types::EXTERNAL_ERROR, "running lab has no lab id", now)
                .await;
        };

        let health = match self.sessions.for_worker(&worker).await {
            Ok(session) => self.sessions.checked(
                &session,
                self.sessions.client().get_lab(&session, &lab_id).await,
            ),
            Err(e) => Err(e),
        };

        match health {
            Ok(Some(info)) if info.state != LabState::Failed => {
                if lab.error_message().is_some() {
                    lab.clear_error();
                    self.labs.save(lab).await?;
                }
                Ok(ReconcileResult::requeue(wait_until(
                    ends_at,
                    now,
                    self.timeouts.max_wait,
                )))
            }
            Ok(Some(_)) => {
                self.fail(lab, condition_types::EXTERNAL_ERROR, "lab reported failed", now)
                    .await
            }
            Ok(None) => {
                self.fail(lab, condition_types::EXTERNAL_ERROR, "lab disappeared from hypervisor", now)
                    .await
            }
            Err(e) => {
                warn!(resource = %lab.id(), error = %e, "Lab health check failed");
                lab.set_error(e.to_string());
                self.labs.save(lab).await?;
                Ok(ReconcileResult::retry(e, self.timeouts.retry_requeue))
            }
        }
    }

    async fn reconcile_stopping(
        &self,
        lab: &mut LabInstanceRequest,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(lab, self.timeouts.lab_stopping, now) {
            return self.fail(lab, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }

        let worker = self.assigned_worker(lab).await?;
        let (Some(worker), Some(lab_id)) = (worker, lab.status.lab_id.clone()) else {
            return self.complete(lab, now).await;
        };

        let session = self.sessions.for_worker(&worker).await?;
        let client = self.sessions.client();
        let current = self
            .sessions
            .checked(&session, client.get_lab(&session, &lab_id).await)?;

        match current {
            None => self.complete(lab, now).await,
            Some(info) => {
                if info.state != LabState::Stopped {
                    ignore_not_found(
                        self.sessions
                            .checked(&session, client.stop_lab(&session, &lab_id).await),
                    )?;
                }
                ignore_not_found(
                    self.sessions
                        .checked(&session, client.delete_lab(&session, &lab_id).await),
                )?;
                debug!(resource = %lab.id(), lab_id = %lab_id, "Requested lab teardown");
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
        }
    }

    async fn complete(
        &self,
        lab: &mut LabInstanceRequest,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        lab.status.completed_at = Some(now);
        lab.status.allocation = None;
        self.transition(lab, LabInstancePhase::Completed, "lab torn down", now)
            .await?;
        Ok(ReconcileResult::done())
    }

    /// Best-effort cleanup, then FAILED.
    async fn fail(
        &self,
        lab: &mut LabInstanceRequest,
        condition_type: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if !self.cleanup(lab).await {
            warn!(resource = %lab.id(), "Cleanup incomplete while failing lab");
        }
        lab.set_error(reason);
        lab.set_condition(Condition::new(condition_type, true, condition_type, reason, now));
        lab.status.completed_at = Some(now);
        self.transition(lab, LabInstancePhase::Failed, reason, now)
            .await?;
        Ok(ReconcileResult::failed(reason))
    }

    async fn assigned_worker(&self, lab: &LabInstanceRequest) -> ControllerResult<Option<Worker>> {
        match &lab.status.worker_ref {
            Some(worker_ref) => Ok(self.workers.get(worker_ref).await?),
            None => Ok(None),
        }
    }

    /// Stop and delete the lab on its hypervisor and release the allocation.
    /// Returns `true` when nothing is left behind.
    async fn cleanup(&self, lab: &mut LabInstanceRequest) -> bool {
        lab.status.allocation = None;

        let Some(lab_id) = lab.status.lab_id.clone() else {
            return true;
        };
        let worker = match self.assigned_worker(lab).await {
            Ok(Some(worker)) => worker,
            // The lab went away with its worker.
            Ok(None) => return true,
            Err(e) => {
                warn!(resource = %lab.id(), error = %e, "Failed to load worker for cleanup");
                return false;
            }
        };

        match self.teardown(&worker, &lab_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(resource = %lab.id(), lab_id = %lab_id, error = %e, "Lab cleanup failed");
                false
            }
        }
    }

    async fn teardown(&self, worker: &Worker, lab_id: &str) -> Result<(), ExternalError> {
        let session: HypervisorSession = self.sessions.for_worker(worker).await?;
        let client = self.sessions.client();
        ignore_not_found(
            self.sessions
                .checked(&session, client.stop_lab(&session, lab_id).await),
        )?;
        ignore_not_found(
            self.sessions
                .checked(&session, client.delete_lab(&session, lab_id).await),
        )
    }
}

/// Treat a missing lab as already gone.
fn ignore_not_found(result: Result<(), ExternalError>) -> Result<(), ExternalError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Controller<LabInstanceSpec> for LabInstanceController {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip(self, resource), fields(resource = %resource.id()))]
    async fn reconcile(&self, resource: &LabInstanceRequest) -> ReconcileResult {
        let result = self.step(resource.id()).await;
        finish(Self::NAME, resource.id(), result, self.timeouts.retry_requeue)
    }

    #[instrument(skip(self, resource), fields(resource = %resource.id()))]
    async fn finalize(&self, resource: &LabInstanceRequest) -> bool {
        let mut lab = resource.clone();
        let clean = self.cleanup(&mut lab).await;
        if clean {
            info!(resource = %resource.id(), "Lab instance finalized");
        }
        clean
    }
}
