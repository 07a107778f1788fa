//! Wires stores, collaborators, controllers, watchers and the scheduler
//! into one control plane.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use labfleet_events::{event_types, ActorType, EventEnvelope, LabInstanceCreatedPayload};
use labfleet_reconcile::Clock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clients::{
    publish_best_effort, CloudProvider, EventPublisher, HypervisorClient, SessionManager,
};
use crate::config::Config;
use crate::controllers::{
    ControllerTimeouts, EventSource, LabInstanceController, WorkerController,
    WorkerPoolController,
};
use crate::error::ControllerError;
use crate::resources::{
    LabInstanceRequest, LabInstanceSpec, ResourceSpec, WorkerPoolSpec, WorkerSpec,
};
use crate::scheduler::{SchedulerWorker, SchedulingStats, WorkerSchedulerService};
use crate::store::{LabInstanceStore, StoreError, WorkerPoolStore, WorkerStore};
use crate::watcher::{ReconcileHandler, ResourceWatcher, WatchStats};

/// External dependencies of the control plane.
#[derive(Clone)]
pub struct Collaborators {
    pub labs: Arc<LabInstanceStore>,
    pub workers: Arc<WorkerStore>,
    pub pools: Arc<WorkerPoolStore>,
    pub cloud: Arc<dyn CloudProvider>,
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
}

/// Stats from one synchronous pass over every loop.
#[derive(Debug, Default, Clone)]
pub struct PassStats {
    pub pools: WatchStats,
    pub workers: WatchStats,
    pub scheduling: SchedulingStats,
    pub labs: WatchStats,
}

pub struct ControlPlane {
    collaborators: Collaborators,
    config: Config,
    lab_watcher: Arc<ResourceWatcher<LabInstanceSpec>>,
    worker_watcher: Arc<ResourceWatcher<WorkerSpec>>,
    pool_watcher: Arc<ResourceWatcher<WorkerPoolSpec>>,
    scheduler: Arc<SchedulerWorker>,
}

impl ControlPlane {
    pub fn new(collaborators: Collaborators, config: Config, timeouts: ControllerTimeouts) -> Self {
        let c = &collaborators;
        let sessions = Arc::new(SessionManager::new(c.hypervisor.clone(), c.clock.clone()));

        let lab_controller = Arc::new(LabInstanceController::new(
            c.labs.clone(),
            c.workers.clone(),
            sessions.clone(),
            c.events.clone(),
            c.clock.clone(),
            timeouts.clone(),
        ));
        let worker_controller = Arc::new(WorkerController::new(
            c.workers.clone(),
            c.cloud.clone(),
            sessions,
            c.events.clone(),
            c.clock.clone(),
            timeouts.clone(),
        ));
        let pool_controller = Arc::new(WorkerPoolController::new(
            c.pools.clone(),
            c.workers.clone(),
            c.events.clone(),
            c.clock.clone(),
            timeouts,
        ));

        let mut lab_watcher =
            ResourceWatcher::new(c.labs.clone()).with_namespace(config.namespace.clone());
        lab_watcher.add_handler(Arc::new(ReconcileHandler::<LabInstanceSpec>::new(
            lab_controller,
            c.labs.clone(),
            c.clock.clone(),
        )));

        let mut worker_watcher =
            ResourceWatcher::new(c.workers.clone()).with_namespace(config.namespace.clone());
        worker_watcher.add_handler(Arc::new(ReconcileHandler::<WorkerSpec>::new(
            worker_controller,
            c.workers.clone(),
            c.clock.clone(),
        )));

        let mut pool_watcher =
            ResourceWatcher::new(c.pools.clone()).with_namespace(config.namespace.clone());
        pool_watcher.add_handler(Arc::new(ReconcileHandler::<WorkerPoolSpec>::new(
            pool_controller,
            c.pools.clone(),
            c.clock.clone(),
        )));

        let scheduler = Arc::new(SchedulerWorker::new(
            c.labs.clone(),
            c.workers.clone(),
            c.pools.clone(),
            Arc::new(WorkerSchedulerService::new(config.scheduler_config())),
            c.events.clone(),
            c.clock.clone(),
            config.namespace.clone(),
            config.scheduler_interval,
        ));

        Self {
            collaborators,
            config,
            lab_watcher: Arc::new(lab_watcher),
            worker_watcher: Arc::new(worker_watcher),
            pool_watcher: Arc::new(pool_watcher),
            scheduler,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Store a new lab request and announce it.
    pub async fn submit_lab(
        &self,
        namespace: &str,
        name: &str,
        spec: LabInstanceSpec,
    ) -> Result<LabInstanceRequest, ControllerError> {
        let c = &self.collaborators;
        let now: DateTime<Utc> = c.clock.now();
        let lab = LabInstanceRequest::create(namespace, name, spec, now)?;
        c.labs.save(&lab).await?;

        info!(
            resource = %lab.id(),
            template = %lab.spec.template,
            requester = %lab.spec.requester,
            "Lab instance submitted"
        );

        publish_best_effort(
            c.events.as_ref(),
            EventEnvelope::builder()
                .occurred_at(now)
                .aggregate(LabInstanceSpec::AGGREGATE_TYPE, lab.id().to_string())
                .generation(lab.metadata.generation)
                .event_type(event_types::LAB_INSTANCE_CREATED)
                .actor(ActorType::System, "control-plane")
                .payload(LabInstanceCreatedPayload {
                    template: lab.spec.template.clone(),
                    requester: lab.spec.requester.clone(),
                    instance_type: lab.spec.instance_type.as_str().to_string(),
                    track: lab.spec.track.clone(),
                    duration_minutes: i64::from(lab.spec.duration_minutes),
                }),
        )
        .await;

        Ok(lab)
    }

    /// One pass of every loop in dependency order: pools create workers,
    /// workers come up, the scheduler assigns labs, labs provision.
    pub async fn run_once(&self) -> Result<PassStats, StoreError> {
        Ok(PassStats {
            pools: self.pool_watcher.tick().await?,
            workers: self.worker_watcher.tick().await?,
            scheduling: self.scheduler.run_once().await?,
            labs: self.lab_watcher.tick().await?,
        })
    }

    /// Spawn the three watcher loops and the scheduler loop.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<(&'static str, JoinHandle<()>)> {
        let interval = self.config.watch_interval;
        vec![
            (
                "lab-watcher",
                spawn_watcher(self.lab_watcher.clone(), interval, shutdown.clone()),
            ),
            (
                "worker-watcher",
                spawn_watcher(self.worker_watcher.clone(), interval, shutdown.clone()),
            ),
            (
                "pool-watcher",
                spawn_watcher(self.pool_watcher.clone(), interval, shutdown.clone()),
            ),
            ("scheduler", {
                let scheduler = self.scheduler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.run(shutdown).await })
            }),
        ]
    }
}

fn spawn_watcher<S: ResourceSpec>(
    watcher: Arc<ResourceWatcher<S>>,
    interval: std::time::Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move { watcher.run(interval, shutdown).await })
}
