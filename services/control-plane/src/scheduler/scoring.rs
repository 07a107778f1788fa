//! Worker scoring for lab placement.
//!
//! A candidate's score is a weighted sum in `[0, 1]`. Hard constraints
//! short-circuit to zero, and a zero score makes the worker ineligible under
//! every strategy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::resources::{LabInstanceRequest, ResourceLimits, Worker, WorkerCapacity, WorkerPhase};

/// How to choose among eligible candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Highest score.
    #[default]
    BestFit,
    /// Lowest mean of cpu, memory and storage utilization.
    LeastUtilized,
    /// Fewest hosted labs.
    LeastLabs,
    /// Rotate through candidates per track.
    RoundRobin,
    Random,
}

impl SchedulingStrategy {
    pub const ALL: &'static [Self] = &[
        Self::BestFit,
        Self::LeastUtilized,
        Self::LeastLabs,
        Self::RoundRobin,
        Self::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BestFit => "best_fit",
            Self::LeastUtilized => "least_utilized",
            Self::LeastLabs => "least_labs",
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("unknown scheduling strategy '{s}'"))
    }
}

/// Weights of the score components. They sum to 1.1 so a worker that earns
/// every bonus is clamped to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub capacity: f64,
    pub lab_headroom: f64,
    pub idleness: f64,
    pub license: f64,
    pub ready: f64,
    pub track: f64,
    pub simulated_network: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capacity: 0.4,
            lab_headroom: 0.2,
            idleness: 0.2,
            license: 0.1,
            ready: 0.05,
            track: 0.05,
            simulated_network: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub strategy: SchedulingStrategy,
    pub weights: ScoringWeights,

    /// Utilization of any single resource at or above which a worker is
    /// excluded.
    pub max_utilization: f64,

    /// Hosted labs below which a worker earns the headroom bonus.
    pub lab_headroom_limit: usize,

    /// Simulated-network requests need a licensed worker.
    pub licensing_required: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::BestFit,
            weights: ScoringWeights::default(),
            max_utilization: 0.8,
            lab_headroom_limit: 15,
            licensing_required: true,
        }
    }
}

/// Worker can host simulated networks.
pub fn simulated_network_capable(worker: &Worker) -> bool {
    worker.status.hypervisor.ready
}

/// Fraction of the scarcest resource still free after placing `limits`.
fn headroom_after(capacity: &WorkerCapacity, limits: &ResourceLimits) -> f64 {
    fn fraction(free: f64, total: f64) -> f64 {
        if total <= 0.0 {
            1.0
        } else {
            (free / total).clamp(0.0, 1.0)
        }
    }

    let cpu = fraction(
        capacity.free_cpu() - limits.cpu_cores,
        capacity.total_cpu,
    );
    let memory = fraction(
        capacity.free_memory_mb() as f64 - limits.memory_mb as f64,
        capacity.total_memory_mb as f64,
    );
    let storage = fraction(
        capacity.free_storage_gb() as f64 - limits.storage_gb as f64,
        capacity.total_storage_gb as f64,
    );
    cpu.min(memory).min(storage)
}

/// The hard constraint `worker` violates for `request`, if any.
pub fn hard_constraint(
    config: &SchedulerConfig,
    worker: &Worker,
    request: &LabInstanceRequest,
) -> Option<&'static str> {
    let capacity = &worker.status.capacity;
    if capacity.cpu_utilization() >= config.max_utilization {
        return Some("cpu utilization");
    }
    if capacity.memory_utilization() >= config.max_utilization {
        return Some("memory utilization");
    }
    if capacity.storage_utilization() >= config.max_utilization {
        return Some("storage utilization");
    }
    if !capacity.fits(&request.spec.resources) {
        return Some("insufficient free capacity");
    }
    if capacity.max_concurrent_labs > 0
        && worker.hosted_labs() >= capacity.max_concurrent_labs as usize
    {
        return Some("lab limit reached");
    }
    if request.spec.instance_type.needs_simulated_network() && !simulated_network_capable(worker) {
        return Some("no simulated network support");
    }
    None
}

/// Placement score of `worker` for `request`; zero on a hard constraint.
/// Not clamped above: the weights sum past 1.
pub fn score_worker(
    config: &SchedulerConfig,
    worker: &Worker,
    request: &LabInstanceRequest,
) -> f64 {
    if hard_constraint(config, worker, request).is_some() {
        return 0.0;
    }

    let w = &config.weights;
    let capacity = &worker.status.capacity;
    let needs_network = request.spec.instance_type.needs_simulated_network();
    let mut score = w.capacity * headroom_after(capacity, &request.spec.resources);

    if worker.hosted_labs() < config.lab_headroom_limit {
        score += w.lab_headroom;
    }
    score += w.idleness * (1.0 - capacity.utilization()).clamp(0.0, 1.0);
    if !needs_network || worker.is_licensed() {
        score += w.license;
    }
    if worker.phase() == WorkerPhase::Ready {
        score += w.ready;
    }
    if request.spec.track.as_deref() == Some(worker.spec.track.as_str()) {
        score += w.track;
    }
    if simulated_network_capable(worker) {
        score += w.simulated_network;
    }

    score.max(0.0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::lab_instance::tests::spec;
    use crate::resources::worker::tests::worker_spec;
    use crate::resources::{InstanceType, ObjectMeta};
    use chrono::Utc;
    use rstest::rstest;

    pub(crate) fn serving_worker(name: &str, phase: WorkerPhase, cpu_used: f64) -> Worker {
        let meta = ObjectMeta::new("workers", name, Utc::now()).unwrap();
        let mut worker = Worker::create(meta, worker_spec("ccna")).unwrap();
        worker.status.lifecycle.phase = phase;
        worker.status.hypervisor.ready = true;
        worker.status.hypervisor.licensed = true;
        worker.status.capacity = WorkerCapacity {
            total_cpu: 32.0,
            allocated_cpu: cpu_used,
            total_memory_mb: 131_072,
            allocated_memory_mb: 0,
            total_storage_gb: 1000,
            allocated_storage_gb: 0,
            max_concurrent_labs: 20,
        };
        worker
    }

    fn request(instance_type: InstanceType) -> LabInstanceRequest {
        LabInstanceRequest::create("labs", "lab-1", spec(instance_type), Utc::now()).unwrap()
    }

    #[test]
    fn test_strategy_parse() {
        for strategy in SchedulingStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<SchedulingStrategy>(), Ok(*strategy));
        }
        assert!("fastest".parse::<SchedulingStrategy>().is_err());
    }

    #[test]
    fn test_idle_worker_scores_near_one() {
        let config = SchedulerConfig::default();
        let worker = serving_worker("w-1", WorkerPhase::Ready, 0.0);
        let score = score_worker(&config, &worker, &request(InstanceType::SimulatedNetwork));
        assert!(score > 0.95, "score was {score}");
    }

    #[rstest]
    #[case::cpu_at_limit(28.0, InstanceType::Container)]
    #[case::fully_allocated(32.0, InstanceType::SimulatedNetwork)]
    fn test_hard_constraints_zero_the_score(#[case] cpu_used: f64, #[case] kind: InstanceType) {
        let config = SchedulerConfig::default();
        let worker = serving_worker("w-1", WorkerPhase::Active, cpu_used);
        assert_eq!(score_worker(&config, &worker, &request(kind)), 0.0);
    }

    #[test]
    fn test_simulated_network_needs_capable_hypervisor() {
        let config = SchedulerConfig::default();
        let mut worker = serving_worker("w-1", WorkerPhase::Ready, 0.0);
        worker.status.hypervisor.ready = false;

        assert_eq!(
            hard_constraint(&config, &worker, &request(InstanceType::Hybrid)),
            Some("no simulated network support")
        );
        assert!(score_worker(&config, &worker, &request(InstanceType::Container)) > 0.0);
    }

    #[test]
    fn test_busier_worker_scores_lower() {
        let config = SchedulerConfig::default();
        let lab = request(InstanceType::Container);
        let idle = score_worker(&config, &serving_worker("w-1", WorkerPhase::Ready, 2.0), &lab);
        let busy = score_worker(&config, &serving_worker("w-2", WorkerPhase::Active, 20.0), &lab);
        assert!(idle > busy);
    }
}
