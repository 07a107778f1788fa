//! Shared fixtures for control-plane integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use labfleet_control_plane::{
    clients::{MockCloudProvider, MockHypervisor, RecordingPublisher, SessionManager},
    controllers::{
        Controller, ControllerTimeouts, LabInstanceController, WorkerController,
        WorkerPoolController,
    },
    resources::{
        CloudInstanceConfig, HypervisorConfig, InstanceType, LabInstanceRequest, LabInstanceSpec,
        ObjectMeta, PoolDesiredState, Resource, ResourceLimits, ResourceSpec, ScalingConfig,
        Worker, WorkerDesiredPhase, WorkerPhase, WorkerPool, WorkerPoolSpec, WorkerSpec,
        WorkerTemplate,
    },
    runtime::Collaborators,
    store::{InMemoryStore, ResourceStore},
};
use labfleet_id::ResourceId;
use labfleet_reconcile::{Clock, ManualClock};

pub const NS: &str = "cohort-1";
pub const TRACK: &str = "ccna";

/// Monday morning, inside any sensible allowed-hours window.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn lab_spec(instance_type: InstanceType) -> LabInstanceSpec {
    LabInstanceSpec {
        template: "ccna-ospf-basics".to_string(),
        duration_minutes: 60,
        requester: "student-17".to_string(),
        instance_type,
        track: Some(TRACK.to_string()),
        scheduled_start: None,
        resources: ResourceLimits {
            cpu_cores: 2.0,
            memory_mb: 4096,
            storage_gb: 10,
        },
    }
}

fn cloud_config() -> CloudInstanceConfig {
    CloudInstanceConfig {
        image_id: "img-hypervisor-2.8".to_string(),
        instance_type: "m5.2xlarge".to_string(),
        region: "eu-west-1".to_string(),
        subnet_id: None,
        security_group_ids: vec!["sg-labs".to_string()],
        key_name: None,
        tags: BTreeMap::new(),
    }
}

fn hypervisor_config() -> HypervisorConfig {
    HypervisorConfig {
        port: 443,
        username: "admin".to_string(),
        password: "hunter2".to_string(),
        license_token: Some("lic-token".to_string()),
        verify_tls: false,
    }
}

pub fn worker_spec() -> WorkerSpec {
    WorkerSpec {
        track: TRACK.to_string(),
        cloud: cloud_config(),
        hypervisor: hypervisor_config(),
        desired_phase: WorkerDesiredPhase::Ready,
        auto_license: true,
    }
}

pub fn pool_spec() -> WorkerPoolSpec {
    WorkerPoolSpec {
        track: TRACK.to_string(),
        template: WorkerTemplate {
            cloud: cloud_config(),
            hypervisor: hypervisor_config(),
            auto_license: true,
        },
        scaling: ScalingConfig::default(),
        desired_state: PoolDesiredState::Active,
    }
}

/// In-memory stores, mock collaborators and a manual clock.
pub struct Env {
    pub clock: Arc<ManualClock>,
    pub labs: Arc<InMemoryStore<LabInstanceSpec>>,
    pub workers: Arc<InMemoryStore<WorkerSpec>>,
    pub pools: Arc<InMemoryStore<WorkerPoolSpec>>,
    pub cloud: Arc<MockCloudProvider>,
    pub hypervisor: Arc<MockHypervisor>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<RecordingPublisher>,
}

impl Env {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let hypervisor = Arc::new(MockHypervisor::with_clock(clock.clone()));
        let sessions = Arc::new(SessionManager::new(hypervisor.clone(), clock.clone()));
        Self {
            labs: Arc::new(InMemoryStore::new()),
            workers: Arc::new(InMemoryStore::new()),
            pools: Arc::new(InMemoryStore::new()),
            cloud: Arc::new(MockCloudProvider::new()),
            hypervisor,
            sessions,
            events: Arc::new(RecordingPublisher::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            labs: self.labs.clone(),
            workers: self.workers.clone(),
            pools: self.pools.clone(),
            cloud: self.cloud.clone(),
            hypervisor: self.hypervisor.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn lab_controller(&self) -> LabInstanceController {
        LabInstanceController::new(
            self.labs.clone(),
            self.workers.clone(),
            self.sessions.clone(),
            self.events.clone(),
            self.clock.clone(),
            ControllerTimeouts::default(),
        )
    }

    pub fn worker_controller(&self) -> WorkerController {
        WorkerController::new(
            self.workers.clone(),
            self.cloud.clone(),
            self.sessions.clone(),
            self.events.clone(),
            self.clock.clone(),
            ControllerTimeouts::default(),
        )
    }

    pub fn pool_controller(&self) -> WorkerPoolController {
        WorkerPoolController::new(
            self.pools.clone(),
            self.workers.clone(),
            self.events.clone(),
            self.clock.clone(),
            ControllerTimeouts::default(),
        )
    }

    pub async fn add_worker(&self, name: &str) -> Worker {
        let meta = ObjectMeta::new(NS, name, self.now()).unwrap();
        let worker = Worker::create(meta, worker_spec()).unwrap();
        self.workers.save(&worker).await.unwrap();
        worker
    }

    /// A worker driven all the way to READY.
    pub async fn ready_worker(&self, name: &str) -> Worker {
        let worker = self.add_worker(name).await;
        drive(
            &self.worker_controller(),
            self.workers.as_ref(),
            worker.id(),
            10,
            |w: &Worker| w.phase() == WorkerPhase::Ready,
        )
        .await
    }

    pub async fn add_pool(&self, name: &str) -> WorkerPool {
        let meta = ObjectMeta::new(NS, name, self.now()).unwrap();
        let pool = WorkerPool::new(meta, pool_spec()).unwrap();
        self.pools.save(&pool).await.unwrap();
        pool
    }

    pub async fn add_lab(&self, name: &str, spec: LabInstanceSpec) -> LabInstanceRequest {
        let lab = LabInstanceRequest::create(NS, name, spec, self.now()).unwrap();
        self.labs.save(&lab).await.unwrap();
        lab
    }
}

/// Reconcile `id` until `done` holds, at most `max_steps` times.
pub async fn drive<S, C, St>(
    controller: &C,
    store: &St,
    id: &ResourceId,
    max_steps: usize,
    done: impl Fn(&Resource<S>) -> bool,
) -> Resource<S>
where
    S: ResourceSpec,
    C: Controller<S>,
    St: ResourceStore<S>,
{
    for _ in 0..max_steps {
        let current = store.require(id).await.unwrap();
        if done(&current) {
            return current;
        }
        controller.reconcile(&current).await;
    }
    let current = store.require(id).await.unwrap();
    assert!(
        done(&current),
        "{id} did not converge after {max_steps} steps: {:?}",
        current.status
    );
    current
}
