//! WorkerPool: a track's autoscaled group of workers.
//!
//! A pool does not own its workers. Membership is the `labfleet.io/pool`
//! label in the pool's namespace, and every aggregate in the status is
//! recomputed from the live workers on each tick.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use labfleet_events::ScaleDirection;
use labfleet_id::{generate_name, ScalingEventId};
use labfleet_reconcile::{Phase, StateMachine};
use serde::{Deserialize, Serialize};

use super::{
    CloudInstanceConfig, HypervisorConfig, Lifecycle, ObjectMeta, Resource, ResourceSpec,
    ResourceStatus, Worker, WorkerDesiredPhase, WorkerPhase, WorkerSpec, POOL_LABEL, TRACK_LABEL,
};
use crate::error::ValidationError;

pub type WorkerPool = Resource<WorkerPoolSpec>;

/// Scaling events kept in the pool status.
pub const MAX_SCALING_EVENTS: usize = 50;

// =============================================================================
// Phase
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolPhase {
    #[default]
    Pending,
    Initializing,
    Ready,
    ScalingUp,
    ScalingDown,
    Draining,
    Terminating,
    Terminated,
    Failed,
}

impl Phase for WorkerPoolPhase {
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Initializing,
        Self::Ready,
        Self::ScalingUp,
        Self::ScalingDown,
        Self::Draining,
        Self::Terminating,
        Self::Terminated,
        Self::Failed,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ScalingUp => "scaling_up",
            Self::ScalingDown => "scaling_down",
            Self::Draining => "draining",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerPoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static POOL_MACHINE: LazyLock<StateMachine<WorkerPoolPhase>> = LazyLock::new(|| {
    use WorkerPoolPhase::*;
    StateMachine::new(
        WorkerPoolSpec::KIND,
        &[
            (Pending, &[Initializing, Draining, Failed]),
            (Initializing, &[Ready, Draining, Failed]),
            (Ready, &[ScalingUp, ScalingDown, Draining, Failed]),
            (ScalingUp, &[Ready, Draining, Failed]),
            (ScalingDown, &[Ready, Draining, Failed]),
            (Draining, &[Terminating, Failed]),
            (Terminating, &[Terminated, Failed]),
            (Failed, &[Draining]),
        ],
    )
});

// =============================================================================
// Spec
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolDesiredState {
    #[default]
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingPolicy {
    /// Hold the count inside `[min_workers, max_workers]`.
    Manual,
    /// Autoscale on capacity thresholds.
    #[default]
    Threshold,
}

/// UTC hours `[start_hour, end_hour)` in which scaling may happen.
///
/// `start_hour == end_hour` means all day; `start_hour > end_hour` wraps
/// past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl AllowedHours {
    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (u32::from(self.start_hour), u32::from(self.end_hour));
        if start == end {
            true
        } else if start < end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub policy: ScalingPolicy,
    pub min_workers: u32,
    pub max_workers: u32,
    pub cpu_scale_up_threshold: f64,
    pub memory_scale_up_threshold: f64,
    pub cpu_scale_down_threshold: f64,
    pub memory_scale_down_threshold: f64,
    pub max_labs_per_worker: u32,
    pub min_labs_per_worker: u32,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_hours: Option<AllowedHours>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            policy: ScalingPolicy::Threshold,
            min_workers: 1,
            max_workers: 5,
            cpu_scale_up_threshold: 0.75,
            memory_scale_up_threshold: 0.75,
            cpu_scale_down_threshold: 0.25,
            memory_scale_down_threshold: 0.25,
            max_labs_per_worker: 10,
            min_labs_per_worker: 2,
            scale_up_cooldown_secs: 5 * 60,
            scale_down_cooldown_secs: 15 * 60,
            allowed_hours: None,
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_workers == 0 {
            return Err(ValidationError::Scaling(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(ValidationError::Scaling(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        for (name, value) in [
            ("cpu_scale_up_threshold", self.cpu_scale_up_threshold),
            ("memory_scale_up_threshold", self.memory_scale_up_threshold),
            ("cpu_scale_down_threshold", self.cpu_scale_down_threshold),
            ("memory_scale_down_threshold", self.memory_scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::Scaling(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.cpu_scale_down_threshold >= self.cpu_scale_up_threshold
            || self.memory_scale_down_threshold >= self.memory_scale_up_threshold
        {
            return Err(ValidationError::Scaling(
                "scale-down thresholds must be below scale-up thresholds".to_string(),
            ));
        }
        if self.min_labs_per_worker > self.max_labs_per_worker {
            return Err(ValidationError::Scaling(
                "min_labs_per_worker exceeds max_labs_per_worker".to_string(),
            ));
        }
        if let Some(hours) = &self.allowed_hours {
            if hours.start_hour > 23 || hours.end_hour > 23 {
                return Err(ValidationError::Scaling(
                    "allowed hours must be within 0..=23".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Blueprint for workers the pool creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub cloud: CloudInstanceConfig,
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub auto_license: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolSpec {
    pub track: String,
    pub template: WorkerTemplate,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub desired_state: PoolDesiredState,
}

impl ResourceSpec for WorkerPoolSpec {
    const KIND: &'static str = "worker_pool";

    type Status = WorkerPoolStatus;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.track.trim().is_empty() {
            return Err(ValidationError::Required { field: "track" });
        }
        self.scaling.validate()?;
        self.worker_spec().validate()
    }
}

impl WorkerPoolSpec {
    /// Spec of a fresh worker built from the template.
    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec {
            track: self.track.clone(),
            cloud: self.template.cloud.clone(),
            hypervisor: self.template.hypervisor.clone(),
            desired_phase: WorkerDesiredPhase::Ready,
            auto_license: self.template.auto_license,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Point-in-time view of one member worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub phase: WorkerPhase,
    pub ready: bool,
    pub licensed: bool,
    pub hosted_labs: u32,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub marked_for_termination: bool,
}

impl WorkerSnapshot {
    pub fn of(worker: &Worker) -> Self {
        Self {
            name: worker.name().to_string(),
            phase: worker.phase(),
            ready: worker.is_ready(),
            licensed: worker.is_licensed(),
            hosted_labs: u32::try_from(worker.hosted_labs()).unwrap_or(u32::MAX),
            cpu_utilization: worker.status.capacity.cpu_utilization(),
            memory_utilization: worker.status.capacity.memory_utilization(),
            marked_for_termination: worker.marked_for_termination(),
        }
    }
}

/// Capacity aggregated over a pool's workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolCapacitySummary {
    pub total_cpu: f64,
    pub allocated_cpu: f64,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
    pub total_hosted_labs: u32,
    pub ready_workers: u32,
    /// Workers counted toward the pool size (not marked for termination,
    /// not terminated).
    pub current_workers: u32,
    /// Averages over ready workers; zero when none are ready.
    pub avg_cpu_utilization: f64,
    pub avg_memory_utilization: f64,
    pub avg_labs_per_worker: f64,
}

impl PoolCapacitySummary {
    pub fn from_workers(workers: &[Worker]) -> Self {
        let mut summary = Self::default();
        let mut cpu_sum = 0.0;
        let mut memory_sum = 0.0;
        let mut ready_labs = 0u32;

        for worker in workers {
            let capacity = &worker.status.capacity;
            let hosted = u32::try_from(worker.hosted_labs()).unwrap_or(u32::MAX);

            summary.total_cpu += capacity.total_cpu;
            summary.allocated_cpu += capacity.allocated_cpu;
            summary.total_memory_mb += capacity.total_memory_mb;
            summary.allocated_memory_mb += capacity.allocated_memory_mb;
            summary.total_hosted_labs = summary.total_hosted_labs.saturating_add(hosted);

            if !worker.marked_for_termination() && worker.phase() != WorkerPhase::Terminated {
                summary.current_workers += 1;
            }
            if worker.is_ready() {
                summary.ready_workers += 1;
                cpu_sum += capacity.cpu_utilization();
                memory_sum += capacity.memory_utilization();
                ready_labs = ready_labs.saturating_add(hosted);
            }
        }

        if summary.ready_workers > 0 {
            let n = f64::from(summary.ready_workers);
            summary.avg_cpu_utilization = cpu_sum / n;
            summary.avg_memory_utilization = memory_sum / n;
            summary.avg_labs_per_worker = f64::from(ready_labs) / n;
        }
        summary
    }

    /// Mean of the cpu and memory averages.
    pub fn utilization(&self) -> f64 {
        (self.avg_cpu_utilization + self.avg_memory_utilization) / 2.0
    }
}

/// One scale decision, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: ScalingEventId,
    pub direction: ScaleDirection,
    pub from_workers: u32,
    pub to_workers: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolStatus {
    #[serde(flatten)]
    pub lifecycle: Lifecycle<WorkerPoolPhase>,

    #[serde(default)]
    pub workers: Vec<WorkerSnapshot>,

    #[serde(default)]
    pub capacity: PoolCapacitySummary,

    #[serde(default)]
    pub ready_workers: u32,

    #[serde(default)]
    pub total_workers: u32,

    /// Most recent last.
    #[serde(default)]
    pub scaling_events: Vec<ScalingEvent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_up_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_down_at: Option<DateTime<Utc>>,
}

impl ResourceStatus for WorkerPoolStatus {
    type Phase = WorkerPoolPhase;

    fn state_machine() -> &'static StateMachine<WorkerPoolPhase> {
        &POOL_MACHINE
    }

    fn lifecycle(&self) -> &Lifecycle<WorkerPoolPhase> {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<WorkerPoolPhase> {
        &mut self.lifecycle
    }

    fn is_transitional(&self) -> bool {
        !matches!(
            self.lifecycle.phase,
            WorkerPoolPhase::Ready | WorkerPoolPhase::Failed | WorkerPoolPhase::Terminated
        )
    }
}

impl WorkerPoolStatus {
    /// Append an event, dropping the oldest beyond [`MAX_SCALING_EVENTS`].
    pub fn record_scaling_event(&mut self, event: ScalingEvent) {
        match event.direction {
            ScaleDirection::Up => self.last_scale_up_at = Some(event.at),
            ScaleDirection::Down => self.last_scale_down_at = Some(event.at),
        }
        self.scaling_events.push(event);
        if self.scaling_events.len() > MAX_SCALING_EVENTS {
            let excess = self.scaling_events.len() - MAX_SCALING_EVENTS;
            self.scaling_events.drain(..excess);
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

impl Resource<WorkerPoolSpec> {
    /// Selector matching this pool's workers.
    pub fn worker_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(POOL_LABEL.to_string(), self.name().to_string())])
    }

    pub fn owns(&self, worker: &Worker) -> bool {
        worker.namespace() == self.namespace()
            && worker.metadata.matches_labels(&self.worker_selector())
    }

    /// A new member worker named `<pool>-<ulid>`.
    pub fn new_worker(&self, now: DateTime<Utc>) -> Result<Worker, ValidationError> {
        let meta = ObjectMeta::new(self.namespace(), generate_name(self.name()), now)?
            .with_label(POOL_LABEL, self.name())
            .with_label(TRACK_LABEL, self.spec.track.as_str());
        Worker::create(meta, self.spec.worker_spec())
    }

    pub fn marked_for_termination(&self) -> bool {
        self.spec.desired_state == PoolDesiredState::Terminated
    }

    /// Record the latest view of the member workers.
    pub fn refresh_from_workers(&mut self, workers: &[Worker]) {
        let capacity = PoolCapacitySummary::from_workers(workers);
        self.status.workers = workers.iter().map(WorkerSnapshot::of).collect();
        self.status.ready_workers = capacity.ready_workers;
        self.status.total_workers = u32::try_from(workers.len()).unwrap_or(u32::MAX);
        self.status.capacity = capacity;
    }

    pub fn scaling_event(
        &self,
        direction: ScaleDirection,
        from_workers: u32,
        to_workers: u32,
        reason: impl Into<String>,
        worker: Option<String>,
        at: DateTime<Utc>,
    ) -> ScalingEvent {
        ScalingEvent {
            id: ScalingEventId::new(),
            direction,
            from_workers,
            to_workers,
            reason: reason.into(),
            worker,
            at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::worker::tests::worker_spec;

    pub(crate) fn pool_spec(track: &str) -> WorkerPoolSpec {
        let w = worker_spec(track);
        WorkerPoolSpec {
            track: track.to_string(),
            template: WorkerTemplate {
                cloud: w.cloud,
                hypervisor: w.hypervisor,
                auto_license: w.auto_license,
            },
            scaling: ScalingConfig::default(),
            desired_state: PoolDesiredState::Active,
        }
    }

    fn pool() -> WorkerPool {
        let meta = ObjectMeta::new("pools", "ccna", Utc::now()).unwrap();
        WorkerPool::new(meta, pool_spec("ccna")).unwrap()
    }

    #[test]
    fn test_allowed_hours() {
        let day = AllowedHours { start_hour: 8, end_hour: 18 };
        assert!(day.contains(8));
        assert!(day.contains(17));
        assert!(!day.contains(18));

        let night = AllowedHours { start_hour: 22, end_hour: 6 };
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(night.contains(5));
        assert!(!night.contains(6));
        assert!(!night.contains(12));

        let always = AllowedHours { start_hour: 3, end_hour: 3 };
        assert!((0..24).all(|h| always.contains(h)));
    }

    #[test]
    fn test_scaling_config_validation() {
        assert!(ScalingConfig::default().validate().is_ok());

        let bad = ScalingConfig {
            min_workers: 6,
            ..ScalingConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ValidationError::Scaling(_))));

        let inverted = ScalingConfig {
            cpu_scale_down_threshold: 0.9,
            ..ScalingConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_new_worker_is_labelled() {
        let pool = pool();
        let worker = pool.new_worker(Utc::now()).unwrap();
        assert!(worker.name().starts_with("ccna-"));
        assert!(pool.owns(&worker));
        assert_eq!(worker.metadata.labels.get(TRACK_LABEL).map(String::as_str), Some("ccna"));
        assert_eq!(worker.phase(), WorkerPhase::Pending);
    }

    #[test]
    fn test_scaling_events_are_bounded() {
        let pool = pool();
        let mut status = WorkerPoolStatus::default();
        let now = Utc::now();
        for i in 0..60 {
            status.record_scaling_event(pool.scaling_event(
                ScaleDirection::Up,
                i,
                i + 1,
                "test",
                None,
                now,
            ));
        }
        assert_eq!(status.scaling_events.len(), MAX_SCALING_EVENTS);
        assert_eq!(status.scaling_events[0].from_workers, 10);
        assert_eq!(status.last_scale_up_at, Some(now));
        assert!(status.last_scale_down_at.is_none());
    }

    #[test]
    fn test_capacity_summary_averages_ready_workers() {
        let pool = pool();
        let now = Utc::now();

        let mut busy = pool.new_worker(now).unwrap();
        busy.status.lifecycle.phase = WorkerPhase::Active;
        busy.status.capacity.total_cpu = 8.0;
        busy.status.capacity.allocated_cpu = 6.0;
        busy.status.hosted_lab_ids = vec!["a".into(), "b".into()];

        let mut idle = pool.new_worker(now).unwrap();
        idle.status.lifecycle.phase = WorkerPhase::Ready;
        idle.status.capacity.total_cpu = 8.0;

        let booting = pool.new_worker(now).unwrap();

        let summary = PoolCapacitySummary::from_workers(&[busy, idle, booting]);
        assert_eq!(summary.ready_workers, 2);
        assert_eq!(summary.current_workers, 3);
        assert_eq!(summary.total_hosted_labs, 2);
        assert!((summary.avg_cpu_utilization - 0.375).abs() < 1e-9);
        assert!((summary.avg_labs_per_worker - 1.0).abs() < 1e-9);
    }
}
