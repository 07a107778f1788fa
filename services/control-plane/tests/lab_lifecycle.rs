//! Lab instance requests driven against the mock hypervisor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drive, lab_spec, Env};
use labfleet_control_plane::{
    controllers::Controller,
    resources::{condition_types, InstanceType, LabInstancePhase, LabInstanceRequest},
    scheduler::{SchedulerConfig, SchedulerWorker, WorkerSchedulerService},
    store::ResourceStore,
};
use labfleet_events::event_types;

fn scheduler(env: &Env) -> SchedulerWorker {
    SchedulerWorker::new(
        env.labs.clone(),
        env.workers.clone(),
        env.pools.clone(),
        Arc::new(WorkerSchedulerService::new(SchedulerConfig::default())),
        env.events.clone(),
        env.clock.clone(),
        None,
        Duration::from_secs(5),
    )
}

async fn fetch(env: &Env, lab: &LabInstanceRequest) -> LabInstanceRequest {
    env.labs.require(lab.id()).await.unwrap()
}

#[tokio::test]
async fn test_lab_runs_to_completion() {
    let env = Env::new();
    let worker = env.ready_worker("w-1").await;
    let url = worker.status.hypervisor.url.clone().unwrap();
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::SimulatedNetwork)).await;
    let controller = env.lab_controller();

    let stats = scheduler(&env).run_once().await.unwrap();
    assert_eq!(stats.scheduled, 1);
    let assigned = fetch(&env, &lab).await;
    assert_eq!(assigned.phase(), LabInstancePhase::Scheduling);
    assert_eq!(assigned.status.worker_ref.as_ref(), Some(worker.id()));

    let running = drive(&controller, env.labs.as_ref(), lab.id(), 5, |l: &LabInstanceRequest| {
        l.phase() == LabInstancePhase::Running
    })
    .await;
    assert_eq!(running.status.started_at, Some(env.now()));
    assert!(running.status.allocation.is_some());
    assert_eq!(env.hypervisor.lab_count(&url), 1);

    // Still inside the requested hour.
    env.clock.advance(Duration::from_secs(30 * 60));
    controller.reconcile(&running).await;
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Running);

    env.clock.advance(Duration::from_secs(31 * 60));
    let completed = drive(&controller, env.labs.as_ref(), lab.id(), 5, |l: &LabInstanceRequest| {
        l.phase() == LabInstancePhase::Completed
    })
    .await;
    assert_eq!(completed.status.completed_at, Some(env.now()));
    assert!(completed.status.allocation.is_none());
    assert_eq!(env.hypervisor.lab_count(&url), 0);

    let phases: Vec<String> = env
        .events
        .of_type(event_types::LAB_INSTANCE_PHASE_CHANGED)
        .iter()
        .map(|e| e.payload["to"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        phases,
        ["scheduling", "provisioning", "running", "stopping", "completed"]
    );
}

#[tokio::test]
async fn test_provisioning_creates_one_lab() {
    let env = Env::new();
    let worker = env.ready_worker("w-1").await;
    let url = worker.status.hypervisor.url.clone().unwrap();
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;
    let controller = env.lab_controller();

    scheduler(&env).run_once().await.unwrap();
    controller.reconcile(&fetch(&env, &lab).await).await;
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Provisioning);

    controller.reconcile(&fetch(&env, &lab).await).await;
    let first = fetch(&env, &lab).await;
    assert_eq!(first.phase(), LabInstancePhase::Provisioning);
    assert_eq!(env.hypervisor.lab_count(&url), 1);

    controller.reconcile(&first).await;
    let second = fetch(&env, &lab).await;
    assert_eq!(second.phase(), LabInstancePhase::Running);
    assert_eq!(second.status.lab_id, first.status.lab_id);
    assert_eq!(env.hypervisor.lab_count(&url), 1);

    controller.reconcile(&second).await;
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Running);
    assert_eq!(env.hypervisor.lab_count(&url), 1);
    assert_eq!(
        env.events
            .of_type(event_types::LAB_INSTANCE_PHASE_CHANGED)
            .iter()
            .filter(|e| e.payload["to"] == "running")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_failed_boot_fails_lab_and_cleans_up() {
    let env = Env::new();
    let worker = env.ready_worker("w-1").await;
    let url = worker.status.hypervisor.url.clone().unwrap();
    env.hypervisor.set_fail_labs(true);
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;

    scheduler(&env).run_once().await.unwrap();
    let failed = drive(&env.lab_controller(), env.labs.as_ref(), lab.id(), 5, |l: &LabInstanceRequest| {
        l.is_terminal()
    })
    .await;

    assert_eq!(failed.phase(), LabInstancePhase::Failed);
    assert_eq!(failed.error_message(), Some("lab failed to boot"));
    assert!(failed.condition(condition_types::EXTERNAL_ERROR).is_some());
    assert_eq!(env.hypervisor.lab_count(&url), 0);
}

#[tokio::test]
async fn test_provisioning_times_out_after_ten_minutes() {
    let env = Env::new();
    let worker = env.ready_worker("w-1").await;
    let url = worker.status.hypervisor.url.clone().unwrap();
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;
    let controller = env.lab_controller();

    scheduler(&env).run_once().await.unwrap();
    controller.reconcile(&fetch(&env, &lab).await).await;
    controller.reconcile(&fetch(&env, &lab).await).await;
    let booting = fetch(&env, &lab).await;
    assert_eq!(booting.phase(), LabInstancePhase::Provisioning);
    assert_eq!(env.hypervisor.lab_count(&url), 1);

    env.clock.advance(Duration::from_secs(11 * 60));
    let result = controller.reconcile(&booting).await;
    assert!(!result.is_success());

    let failed = fetch(&env, &lab).await;
    assert_eq!(failed.phase(), LabInstancePhase::Failed);
    assert!(failed.condition(condition_types::TIMED_OUT).unwrap().status);
    assert!(failed.status.allocation.is_none());
    assert_eq!(env.hypervisor.lab_count(&url), 0);
}

#[tokio::test]
async fn test_stopping_times_out_after_five_minutes() {
    let env = Env::new();
    env.ready_worker("w-1").await;
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;
    let controller = env.lab_controller();

    scheduler(&env).run_once().await.unwrap();
    drive(&controller, env.labs.as_ref(), lab.id(), 5, |l: &LabInstanceRequest| {
        l.phase() == LabInstancePhase::Running
    })
    .await;

    env.clock.advance(Duration::from_secs(61 * 60));
    controller.reconcile(&fetch(&env, &lab).await).await;
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Stopping);

    // Teardown cannot reach the hypervisor.
    env.hypervisor.set_unreachable(true);
    let result = controller.reconcile(&fetch(&env, &lab).await).await;
    assert!(!result.is_success());
    assert!(result.requeue_after.is_some());
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Stopping);

    env.clock.advance(Duration::from_secs(6 * 60));
    controller.reconcile(&fetch(&env, &lab).await).await;

    let failed = fetch(&env, &lab).await;
    assert_eq!(failed.phase(), LabInstancePhase::Failed);
    assert!(failed.condition(condition_types::TIMED_OUT).unwrap().status);
    assert!(failed.error_message().is_some());
}

#[tokio::test]
async fn test_unassigned_lab_expires_after_window() {
    let env = Env::new();
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;
    let controller = env.lab_controller();

    let result = controller.reconcile(&lab).await;
    assert!(result.is_success());
    assert!(result.requeue_after.is_some());
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Pending);

    env.clock.advance(Duration::from_secs(60 * 60));
    let result = controller.reconcile(&fetch(&env, &lab).await).await;
    assert_eq!(result.requeue_after, None);
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Expired);
}

#[tokio::test]
async fn test_future_start_waits_with_capped_requeue() {
    let env = Env::new();
    let mut spec = lab_spec(InstanceType::Container);
    spec.scheduled_start = Some(env.now() + chrono::Duration::minutes(10));
    let lab = env.add_lab("lab-1", spec).await;

    let result = env.lab_controller().reconcile(&lab).await;
    assert_eq!(result.requeue_after, Some(Duration::from_secs(60)));
    assert_eq!(fetch(&env, &lab).await.phase(), LabInstancePhase::Pending);
}

#[tokio::test]
async fn test_vanished_worker_releases_assignment() {
    let env = Env::new();
    let worker = env.ready_worker("w-1").await;
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;

    scheduler(&env).run_once().await.unwrap();
    env.workers.delete(worker.id()).await.unwrap();
    env.lab_controller().reconcile(&fetch(&env, &lab).await).await;

    let released = fetch(&env, &lab).await;
    assert_eq!(released.phase(), LabInstancePhase::Pending);
    assert!(released.status.worker_ref.is_none());
    assert!(released.is_schedulable());
    let condition = released
        .condition(condition_types::WORKER_UNAVAILABLE)
        .unwrap();
    assert!(condition.status);
}

#[tokio::test]
async fn test_finalize_removes_hypervisor_lab() {
    let env = Env::new();
    let worker = env.ready_worker("w-1").await;
    let url = worker.status.hypervisor.url.clone().unwrap();
    let lab = env.add_lab("lab-1", lab_spec(InstanceType::Container)).await;
    let controller = env.lab_controller();

    scheduler(&env).run_once().await.unwrap();
    let running = drive(&controller, env.labs.as_ref(), lab.id(), 5, |l: &LabInstanceRequest| {
        l.phase() == LabInstancePhase::Running
    })
    .await;
    assert_eq!(env.hypervisor.lab_count(&url), 1);

    env.labs.delete(lab.id()).await.unwrap();
    assert!(controller.finalize(&running).await);
    assert_eq!(env.hypervisor.lab_count(&url), 0);

    // Nothing left to clean on a second attempt.
    assert!(controller.finalize(&running).await);
}
