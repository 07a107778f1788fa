//! Worker controller.
//!
//! Brings a cloud VM up to a serving hypervisor, keeps its lab inventory
//! and capacity current, and takes it down again when the owner sets
//! `desired_phase = terminated`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_id::ResourceId;
use labfleet_reconcile::{Clock, ReconcileResult};
use tracing::{debug, info, instrument, warn};

use super::{
    apply_transition, finish, observe_generation, phase_expired, save_if_changed, Controller,
    ControllerTimeouts,
};
use crate::clients::{
    CloudProvider, EventPublisher, InstanceInfo, InstanceState, LicenseState, SessionManager,
};
use crate::error::{ControllerResult, ExternalError};
use crate::resources::{
    condition_types, Condition, Worker, WorkerPhase, WorkerSpec, POOL_LABEL, TRACK_LABEL,
};
use crate::store::WorkerStore;

/// Cloud tag carrying the worker's resource id.
pub const WORKER_TAG: &str = "labfleet.io/worker";

pub struct WorkerController {
    workers: Arc<WorkerStore>,
    cloud: Arc<dyn CloudProvider>,
    sessions: Arc<SessionManager>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    timeouts: ControllerTimeouts,
}

impl WorkerController {
    pub const NAME: &'static str = "worker-controller";

    pub fn new(
        workers: Arc<WorkerStore>,
        cloud: Arc<dyn CloudProvider>,
        sessions: Arc<SessionManager>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        timeouts: ControllerTimeouts,
    ) -> Self {
        Self {
            workers,
            cloud,
            sessions,
            events,
            clock,
            timeouts,
        }
    }

    async fn transition(
        &self,
        worker: &mut Worker,
        target: WorkerPhase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        apply_transition(
            self.workers.as_ref(),
            self.events.as_ref(),
            Self::NAME,
            worker,
            target,
            reason,
            now,
        )
        .await
    }

    /// Transition and ask for a prompt revisit.
    async fn advance(
        &self,
        worker: &mut Worker,
        target: WorkerPhase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        self.transition(worker, target, reason, now).await?;
        Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
    }

    async fn step(&self, id: &ResourceId) -> ControllerResult<ReconcileResult> {
        let Some(mut worker) = self.workers.get(id).await? else {
            debug!(resource = %id, "Worker no longer exists");
            return Ok(ReconcileResult::done());
        };
        observe_generation(self.workers.as_ref(), &mut worker).await?;
        let now = self.clock.now();

        if worker.marked_for_termination() {
            if let Some(result) = self.begin_shutdown(&mut worker, now).await? {
                return Ok(result);
            }
        }

        match worker.phase() {
            WorkerPhase::Pending => self.reconcile_pending(&mut worker, now).await,
            WorkerPhase::ProvisioningCloud => {
                self.reconcile_provisioning_cloud(&mut worker, now).await
            }
            WorkerPhase::CloudReady => self.reconcile_cloud_ready(&mut worker, now).await,
            WorkerPhase::Starting => self.reconcile_starting(&mut worker, now).await,
            WorkerPhase::Licensing => self.reconcile_licensing(&mut worker, now).await,
            WorkerPhase::Ready | WorkerPhase::ReadyUnlicensed | WorkerPhase::Active => {
                self.reconcile_serving(&mut worker, now).await
            }
            WorkerPhase::Draining => self.reconcile_draining(&mut worker, now).await,
            WorkerPhase::Unlicensing => self.reconcile_unlicensing(&mut worker, now).await,
            WorkerPhase::Stopping => self.reconcile_stopping(&mut worker, now).await,
            WorkerPhase::TerminatingCloud => {
                self.reconcile_terminating_cloud(&mut worker, now).await
            }
            WorkerPhase::Failed | WorkerPhase::Terminated => Ok(ReconcileResult::done()),
        }
    }

    /// Route a worker marked for termination onto the shutdown path.
    ///
    /// Returns `None` when the current phase already is on that path (or
    /// must finish first).
    async fn begin_shutdown(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<Option<ReconcileResult>> {
        const REASON: &str = "termination requested";

        let target = match worker.phase() {
            WorkerPhase::Pending => {
                self.transition(worker, WorkerPhase::Terminated, REASON, now)
                    .await?;
                return Ok(Some(ReconcileResult::done()));
            }
            WorkerPhase::ProvisioningCloud | WorkerPhase::CloudReady => {
                WorkerPhase::TerminatingCloud
            }
            WorkerPhase::Starting => WorkerPhase::Stopping,
            WorkerPhase::Ready | WorkerPhase::ReadyUnlicensed | WorkerPhase::Active => {
                WorkerPhase::Draining
            }
            WorkerPhase::Failed => {
                if self.instance_running(worker).await {
                    WorkerPhase::Stopping
                } else {
                    WorkerPhase::TerminatingCloud
                }
            }
            WorkerPhase::Licensing
            | WorkerPhase::Draining
            | WorkerPhase::Unlicensing
            | WorkerPhase::Stopping
            | WorkerPhase::TerminatingCloud
            | WorkerPhase::Terminated => return Ok(None),
        };

        self.advance(worker, target, REASON, now).await.map(Some)
    }

    async fn instance_running(&self, worker: &Worker) -> bool {
        let Some(instance_id) = worker.instance_id() else {
            return false;
        };
        match self.cloud.get_instance(instance_id).await {
            Ok(info) => matches!(info.state, InstanceState::Pending | InstanceState::Running),
            Err(e) => {
                warn!(resource = %worker.id(), error = %e, "Could not read instance state");
                false
            }
        }
    }

    async fn reconcile_pending(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let mut config = worker.spec.cloud.clone();
        config
            .tags
            .insert(WORKER_TAG.to_string(), worker.id().to_string());
        config
            .tags
            .insert(TRACK_LABEL.to_string(), worker.spec.track.clone());
        if let Some(pool) = worker.metadata.labels.get(POOL_LABEL) {
            config.tags.insert(POOL_LABEL.to_string(), pool.clone());
        }

        let launched = match self.adoptable_instance(worker).await {
            Ok(Some(info)) => {
                info!(resource = %worker.id(), instance_id = %info.instance_id, "Adopting tagged instance");
                Ok(info)
            }
            Ok(None) => self.cloud.provision(worker.name(), &config).await,
            Err(e) => Err(e),
        };

        match launched {
            Ok(info) => {
                info!(resource = %worker.id(), instance_id = %info.instance_id, "Provisioned cloud instance");
                worker.status.cloud.instance_id = Some(info.instance_id);
                worker.status.cloud.state = Some(info.state.to_string());
                worker.status.error_count = 0;
                worker.clear_error();
                self.advance(worker, WorkerPhase::ProvisioningCloud, "instance launched", now)
                    .await
            }
            Err(e) => self.record_external_error(worker, e, now).await,
        }
    }

    async fn reconcile_provisioning_cloud(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(worker, self.timeouts.worker_provisioning_cloud, now) {
            return self.fail(worker, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }
        let Some(instance_id) = worker.instance_id().map(str::to_string) else {
            return self
                .fail(worker, condition_types::EXTERNAL_ERROR, "no cloud instance recorded", now)
                .await;
        };

        let info = match self.cloud.get_instance(&instance_id).await {
            Ok(info) => info,
            Err(e) => return self.record_external_error(worker, e, now).await,
        };
        worker.status.cloud.state = Some(info.state.to_string());

        match info.state {
            InstanceState::Running if info.has_address() => {
                worker.status.cloud.public_ip = info.public_ip;
                worker.status.cloud.private_ip = info.private_ip;
                worker.status.error_count = 0;
                self.advance(worker, WorkerPhase::CloudReady, "instance running", now)
                    .await
            }
            InstanceState::Stopped | InstanceState::Terminating | InstanceState::Terminated => {
                let reason = format!("instance {instance_id} is {}", info.state);
                self.fail(worker, condition_types::EXTERNAL_ERROR, &reason, now)
                    .await
            }
            InstanceState::Pending | InstanceState::Running | InstanceState::Stopping => {
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
        }
    }

    async fn reconcile_cloud_ready(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let Some(url) = worker.hypervisor_url() else {
            return self
                .fail(worker, condition_types::EXTERNAL_ERROR, "instance has no address", now)
                .await;
        };
        worker.status.hypervisor.url = Some(url);
        self.advance(worker, WorkerPhase::Starting, "waiting for hypervisor", now)
            .await
    }

    async fn reconcile_starting(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(worker, self.timeouts.worker_starting, now) {
            return self.fail(worker, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }

        // The hypervisor refuses connections while it boots; keep polling
        // until the phase ceiling.
        let session = match self.sessions.for_worker(worker).await {
            Ok(session) => session,
            Err(e) => {
                debug!(resource = %worker.id(), error = %e, "Hypervisor not reachable yet");
                return Ok(ReconcileResult::requeue(self.timeouts.poll_interval));
            }
        };
        let client = self.sessions.client();
        match self
            .sessions
            .checked(&session, client.check_ready(&session).await)
        {
            Ok(true) => {}
            Ok(false) => return Ok(ReconcileResult::requeue(self.timeouts.poll_interval)),
            Err(e) => {
                debug!(resource = %worker.id(), error = %e, "Hypervisor not ready yet");
                return Ok(ReconcileResult::requeue(self.timeouts.poll_interval));
            }
        }

        let system = self
            .sessions
            .checked(&session, client.get_system_information(&session).await)?;
        let stats = self
            .sessions
            .checked(&session, client.get_system_stats(&session).await)?;

        worker.status.hypervisor.ready = true;
        worker.status.hypervisor.version = Some(system.version);
        worker.status.capacity = stats.into();
        worker.status.error_count = 0;

        let wants_license =
            worker.spec.auto_license && worker.spec.hypervisor.license_token.is_some();
        if wants_license {
            self.advance(worker, WorkerPhase::Licensing, "hypervisor ready", now)
                .await
        } else {
            self.advance(worker, WorkerPhase::ReadyUnlicensed, "hypervisor ready", now)
                .await
        }
    }

    async fn reconcile_licensing(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(worker, self.timeouts.worker_licensing, now) {
            return self.fail(worker, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }

        let session = match self.sessions.for_worker(worker).await {
            Ok(session) => session,
            Err(e) => return self.record_external_error(worker, e, now).await,
        };
        let client = self.sessions.client();
        let license = match self
            .sessions
            .checked(&session, client.get_license(&session).await)
        {
            Ok(license) => license,
            Err(e) => return self.record_external_error(worker, e, now).await,
        };

        match license.state {
            LicenseState::Registered => {
                worker.status.hypervisor.licensed = true;
                worker.status.hypervisor.license_requested = false;
                worker.set_condition(Condition::new(
                    condition_types::LICENSE_REQUESTED,
                    false,
                    "Registered",
                    "license registered",
                    now,
                ));
                self.advance(worker, WorkerPhase::Ready, "license registered", now)
                    .await
            }
            LicenseState::Rejected => {
                let detail = license
                    .detail
                    .unwrap_or_else(|| "license token rejected".to_string());
                worker.status.hypervisor.licensed = false;
                worker.status.hypervisor.license_requested = false;
                worker.set_condition(Condition::new(
                    condition_types::LICENSE_REJECTED,
                    true,
                    "Rejected",
                    detail.as_str(),
                    now,
                ));
                self.advance(worker, WorkerPhase::ReadyUnlicensed, &detail, now)
                    .await
            }
            LicenseState::InProgress => Ok(ReconcileResult::requeue(self.timeouts.poll_interval)),
            LicenseState::Unregistered if worker.status.hypervisor.license_requested => {
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
            LicenseState::Unregistered => {
                let Some(token) = worker.spec.hypervisor.license_token.clone() else {
                    return self
                        .advance(worker, WorkerPhase::ReadyUnlicensed, "no license token", now)
                        .await;
                };
                if let Err(e) = self
                    .sessions
                    .checked(&session, client.set_license(&session, &token).await)
                {
                    return self.record_external_error(worker, e, now).await;
                }
                info!(resource = %worker.id(), "Submitted license registration");
                worker.status.hypervisor.license_requested = true;
                worker.set_condition(Condition::new(
                    condition_types::LICENSE_REQUESTED,
                    true,
                    "Submitted",
                    "license registration submitted",
                    now,
                ));
                self.workers.save(worker).await?;
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
        }
    }

    /// READY, READY_UNLICENSED and ACTIVE: refresh inventory, flip between
    /// ACTIVE and READY on the hosted-lab count.
    async fn reconcile_serving(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let before = worker.status.clone();
        if let Err(e) = self.refresh_inventory(worker, now).await {
            return self.record_external_error(worker, e, now).await;
        }

        let phase = worker.phase();
        let target = if worker.hosted_labs() > 0 {
            WorkerPhase::Active
        } else if phase == WorkerPhase::Active {
            if worker.is_licensed() {
                WorkerPhase::Ready
            } else {
                WorkerPhase::ReadyUnlicensed
            }
        } else {
            phase
        };

        if target != phase {
            let reason = format!("{} labs hosted", worker.hosted_labs());
            self.transition(worker, target, &reason, now).await?;
        } else {
            save_if_changed(self.workers.as_ref(), worker, &before).await?;
        }
        Ok(ReconcileResult::requeue(self.timeouts.steady_requeue))
    }

    async fn reconcile_draining(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let before = worker.status.clone();
        if let Err(e) = self.refresh_inventory(worker, now).await {
            return self.record_external_error(worker, e, now).await;
        }

        if worker.hosted_labs() > 0 {
            save_if_changed(self.workers.as_ref(), worker, &before).await?;
            debug!(resource = %worker.id(), hosted = worker.hosted_labs(), "Waiting for labs to drain");
            return Ok(ReconcileResult::requeue(self.timeouts.steady_requeue));
        }

        if worker.is_licensed() {
            self.advance(worker, WorkerPhase::Unlicensing, "drained", now)
                .await
        } else {
            self.advance(worker, WorkerPhase::Stopping, "drained", now).await
        }
    }

    async fn reconcile_unlicensing(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let removed = match self.sessions.for_worker(worker).await {
            Ok(session) => self.sessions.checked(
                &session,
                self.sessions.client().remove_license(&session).await,
            ),
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            warn!(resource = %worker.id(), error = %e, "Failed to remove license; continuing shutdown");
        }
        worker.status.hypervisor.licensed = false;
        self.advance(worker, WorkerPhase::Stopping, "license released", now)
            .await
    }

    async fn reconcile_stopping(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(worker, self.timeouts.worker_stopping, now) {
            return self.fail(worker, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }
        let Some(instance_id) = worker.instance_id().map(str::to_string) else {
            return self
                .advance(worker, WorkerPhase::TerminatingCloud, "no instance to stop", now)
                .await;
        };

        let info = match self.cloud.get_instance(&instance_id).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return self
                    .advance(worker, WorkerPhase::TerminatingCloud, "instance gone", now)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        worker.status.cloud.state = Some(info.state.to_string());
        worker.status.hypervisor.ready = false;

        match info.state {
            InstanceState::Stopped | InstanceState::Terminating | InstanceState::Terminated => {
                self.advance(worker, WorkerPhase::TerminatingCloud, "instance stopped", now)
                    .await
            }
            InstanceState::Pending | InstanceState::Running => {
                self.cloud.stop(&instance_id).await?;
                self.workers.save(worker).await?;
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
            InstanceState::Stopping => {
                self.workers.save(worker).await?;
                Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
            }
        }
    }

    async fn reconcile_terminating_cloud(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(e) = phase_expired(worker, self.timeouts.worker_terminating, now) {
            return self.fail(worker, condition_types::TIMED_OUT, &e.to_string(), now).await;
        }
        let Some(instance_id) = worker.instance_id().map(str::to_string) else {
            self.transition(worker, WorkerPhase::Terminated, "no instance to terminate", now)
                .await?;
            return Ok(ReconcileResult::done());
        };

        let state = match self.cloud.get_instance(&instance_id).await {
            Ok(info) => info.state,
            Err(e) if e.is_not_found() => InstanceState::Terminated,
            Err(e) => return Err(e.into()),
        };
        worker.status.cloud.state = Some(state.to_string());

        if state == InstanceState::Terminated {
            if let Some(url) = worker.status.hypervisor.url.as_deref() {
                self.sessions.invalidate(url);
            }
            worker.status.hypervisor.ready = false;
            worker.status.hosted_lab_ids.clear();
            self.transition(worker, WorkerPhase::Terminated, "instance terminated", now)
                .await?;
            return Ok(ReconcileResult::done());
        }

        if state != InstanceState::Terminating {
            self.cloud.terminate(&instance_id).await?;
        }
        self.workers.save(worker).await?;
        Ok(ReconcileResult::requeue(self.timeouts.poll_interval))
    }

    /// Health check, lab inventory and capacity from the hypervisor.
    async fn refresh_inventory(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
    ) -> Result<(), ExternalError> {
        let session = self.sessions.for_worker(worker).await?;
        let client = self.sessions.client();

        let healthy = self
            .sessions
            .checked(&session, client.health_check(&session).await)?;
        if !healthy {
            return Err(ExternalError::Hypervisor(
                "hypervisor health check failed".to_string(),
            ));
        }

        let labs = self
            .sessions
            .checked(&session, client.list_labs(&session).await)?;
        let stats = self
            .sessions
            .checked(&session, client.get_system_stats(&session).await)?;

        worker.status.hosted_lab_ids = labs.into_iter().map(|l| l.id).collect();
        worker.status.capacity = stats.into();
        worker.status.last_health_check_at = Some(now);
        worker.status.error_count = 0;
        if worker.error_message().is_some() {
            worker.clear_error();
            worker.set_condition(Condition::new(
                condition_types::HEALTHY,
                true,
                "Recovered",
                "hypervisor reachable",
                now,
            ));
        }
        Ok(())
    }

    /// Count a failed external call; fail the worker once the limit is hit.
    async fn record_external_error(
        &self,
        worker: &mut Worker,
        error: ExternalError,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        worker.status.error_count += 1;
        let message = error.to_string();
        warn!(
            resource = %worker.id(),
            phase = %worker.phase(),
            error_count = worker.status.error_count,
            error = %message,
            "External call failed"
        );

        if worker.status.error_count >= self.timeouts.max_external_errors {
            let reason = format!(
                "{} consecutive external failures, last: {message}",
                worker.status.error_count
            );
            return self
                .fail(worker, condition_types::EXTERNAL_ERROR, &reason, now)
                .await;
        }

        worker.set_error(message.as_str());
        worker.set_condition(Condition::new(
            condition_types::EXTERNAL_ERROR,
            true,
            "CallFailed",
            message.as_str(),
            now,
        ));
        self.workers.save(worker).await?;
        Ok(ReconcileResult::retry(error, self.timeouts.retry_requeue))
    }

    /// Best-effort stop of the instance, then FAILED.
    async fn fail(
        &self,
        worker: &mut Worker,
        condition_type: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        if let Some(instance_id) = worker.instance_id() {
            if let Err(e) = self.cloud.stop(instance_id).await {
                warn!(resource = %worker.id(), error = %e, "Best-effort instance stop failed");
            }
        }
        worker.set_error(reason);
        worker.set_condition(Condition::new(condition_type, true, condition_type, reason, now));
        self.transition(worker, WorkerPhase::Failed, reason, now)
            .await?;
        Ok(ReconcileResult::failed(reason))
    }

    /// A live instance already tagged for `worker`, left by a launch whose
    /// result was never saved.
    async fn adoptable_instance(
        &self,
        worker: &Worker,
    ) -> Result<Option<InstanceInfo>, ExternalError> {
        let filters = BTreeMap::from([(WORKER_TAG.to_string(), worker.id().to_string())]);
        Ok(self.cloud.list(&filters).await?.into_iter().find(|i| {
            matches!(i.state, InstanceState::Pending | InstanceState::Running)
        }))
    }
}

#[async_trait]
impl Controller<WorkerSpec> for WorkerController {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip(self, resource), fields(resource = %resource.id()))]
    async fn reconcile(&self, resource: &Worker) -> ReconcileResult {
        let result = self.step(resource.id()).await;
        finish(Self::NAME, resource.id(), result, self.timeouts.retry_requeue)
    }

    /// Always attempts to terminate the cloud instance.
    #[instrument(skip(self, resource), fields(resource = %resource.id()))]
    async fn finalize(&self, resource: &Worker) -> bool {
        if let Some(url) = resource.status.hypervisor.url.as_deref() {
            self.sessions.invalidate(url);
        }
        let Some(instance_id) = resource.instance_id() else {
            return true;
        };
        match self.cloud.terminate(instance_id).await {
            Ok(()) => {
                info!(resource = %resource.id(), instance_id = %instance_id, "Worker finalized");
                true
            }
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(resource = %resource.id(), error = %e, "Failed to terminate instance");
                false
            }
        }
    }
}
