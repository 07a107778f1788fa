//! Placement of lab requests onto workers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use labfleet_id::ResourceId;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use super::scoring::{score_worker, SchedulerConfig, SchedulingStrategy};
use crate::error::ValidationError;
use crate::resources::{LabInstanceRequest, ResourceSpec, Worker, WorkerPool, WorkerPoolPhase};

/// Round-robin key for requests without a track.
const DEFAULT_TRACK_KEY: &str = "default";

/// Why a request could not be placed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingFailure {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("no worker is ready")]
    WorkerNotReady,

    #[error("no licensed worker is ready")]
    WorkerNotLicensed,

    #[error("no worker has capacity for the lab")]
    NoCapacityAvailable,

    #[error("no worker serves track '{0}'")]
    NoMatchingTrack(String),

    #[error("invalid lab type: {0}")]
    InvalidLabType(String),

    #[error("request cannot be scheduled: {0}")]
    InvalidRequest(String),
}

impl SchedulingFailure {
    /// Stable reason code used in conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoWorkersAvailable => "NoWorkersAvailable",
            Self::WorkerNotReady => "WorkerNotReady",
            Self::WorkerNotLicensed => "WorkerNotLicensed",
            Self::NoCapacityAvailable => "NoCapacityAvailable",
            Self::NoMatchingTrack(_) => "NoMatchingTrack",
            Self::InvalidLabType(_) => "InvalidLabType",
            Self::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

/// A successful placement.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingDecision {
    pub worker: ResourceId,
    pub pool: Option<ResourceId>,
    pub strategy: SchedulingStrategy,
    pub score: f64,
    pub candidates_evaluated: usize,
    pub latency: Duration,
}

struct Candidate<'a> {
    worker: &'a Worker,
    score: f64,
}

/// Scores candidate workers and picks one per the configured strategy.
pub struct WorkerSchedulerService {
    config: SchedulerConfig,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl WorkerSchedulerService {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Place `request` on one of `workers`.
    pub fn schedule_lab_instance(
        &self,
        request: &LabInstanceRequest,
        workers: &[Worker],
    ) -> Result<SchedulingDecision, SchedulingFailure> {
        let started = Instant::now();
        Self::validate(request)?;
        self.schedule_among(request, workers.iter().collect(), started)
    }

    /// Place `request` in the best pool serving its track.
    pub fn schedule_in_pool(
        &self,
        request: &LabInstanceRequest,
        pools: &[WorkerPool],
        workers: &[Worker],
    ) -> Result<SchedulingDecision, SchedulingFailure> {
        let started = Instant::now();
        Self::validate(request)?;

        let Some(pool) = self.select_pool(request, pools) else {
            let serving_track = pools.iter().any(|p| Self::pool_serves(p, request));
            return Err(if serving_track {
                SchedulingFailure::WorkerNotReady
            } else {
                SchedulingFailure::NoMatchingTrack(Self::track_key(request).to_string())
            });
        };

        let members = workers.iter().filter(|w| pool.owns(w)).collect();
        let mut decision = self.schedule_among(request, members, started)?;
        decision.pool = Some(pool.id().clone());
        Ok(decision)
    }

    /// Pool with the most spare ready capacity for the request's track.
    pub fn select_pool<'a>(
        &self,
        request: &LabInstanceRequest,
        pools: &'a [WorkerPool],
    ) -> Option<&'a WorkerPool> {
        let mut ranked: Vec<(&WorkerPool, f64)> = pools
            .iter()
            .filter(|p| Self::pool_serves(p, request))
            .filter(|p| {
                matches!(
                    p.phase(),
                    WorkerPoolPhase::Ready | WorkerPoolPhase::ScalingUp | WorkerPoolPhase::ScalingDown
                ) && !p.marked_for_termination()
                    && p.status.ready_workers > 0
            })
            .map(|p| {
                let capacity = &p.status.capacity;
                let rank =
                    (1.0 - capacity.utilization()).max(0.0) * f64::from(capacity.ready_workers);
                (p, rank)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.name().cmp(b.0.name()));

        let mut best: Option<(&WorkerPool, f64)> = None;
        for (pool, rank) in ranked {
            if best.is_none_or(|(_, top)| rank > top) {
                best = Some((pool, rank));
            }
        }
        best.map(|(pool, _)| pool)
    }

    fn pool_serves(pool: &WorkerPool, request: &LabInstanceRequest) -> bool {
        request
            .spec
            .track
            .as_deref()
            .is_none_or(|track| pool.spec.track == track)
    }

    fn track_key(request: &LabInstanceRequest) -> &str {
        request.spec.track.as_deref().unwrap_or(DEFAULT_TRACK_KEY)
    }

    fn validate(request: &LabInstanceRequest) -> Result<(), SchedulingFailure> {
        if !request.is_schedulable() {
            let why = if request.is_assigned() {
                "already assigned".to_string()
            } else {
                format!("phase is {}", request.phase())
            };
            return Err(SchedulingFailure::InvalidRequest(why));
        }
        match request.spec.validate() {
            Ok(()) => Ok(()),
            Err(ValidationError::InvalidLabType(message)) => {
                Err(SchedulingFailure::InvalidLabType(message))
            }
            Err(e) => Err(SchedulingFailure::InvalidRequest(e.to_string())),
        }
    }

    /// Narrow `workers` down step by step, failing with the most specific
    /// reason for the last filter that emptied the set.
    fn schedule_among(
        &self,
        request: &LabInstanceRequest,
        workers: Vec<&Worker>,
        started: Instant,
    ) -> Result<SchedulingDecision, SchedulingFailure> {
        let workers: Vec<&Worker> = workers
            .into_iter()
            .filter(|w| !w.marked_for_termination())
            .collect();
        if workers.is_empty() {
            return Err(SchedulingFailure::NoWorkersAvailable);
        }

        // Track is a score component here; only the pool path scopes by it.
        let serving: Vec<&Worker> = workers.into_iter().filter(|w| w.is_ready()).collect();
        if serving.is_empty() {
            return Err(SchedulingFailure::WorkerNotReady);
        }

        let licensed: Vec<&Worker> = if request.spec.instance_type.needs_simulated_network()
            && self.config.licensing_required
        {
            serving.into_iter().filter(|w| w.is_licensed()).collect()
        } else {
            serving
        };
        if licensed.is_empty() {
            return Err(SchedulingFailure::WorkerNotLicensed);
        }

        let candidates_evaluated = licensed.len();
        let mut eligible: Vec<Candidate<'_>> = licensed
            .into_iter()
            .map(|worker| Candidate {
                worker,
                score: score_worker(&self.config, worker, request),
            })
            .filter(|c| c.score > 0.0)
            .collect();
        if eligible.is_empty() {
            return Err(SchedulingFailure::NoCapacityAvailable);
        }
        eligible.sort_by(|a, b| a.worker.name().cmp(b.worker.name()));

        let index = self.pick(request, &eligible);
        let chosen = &eligible[index];
        let decision = SchedulingDecision {
            worker: chosen.worker.id().clone(),
            pool: None,
            strategy: self.config.strategy,
            score: chosen.score,
            candidates_evaluated,
            latency: started.elapsed(),
        };

        debug!(
            request = %request.id(),
            worker = %decision.worker,
            strategy = %decision.strategy,
            score = decision.score,
            candidates = candidates_evaluated,
            eligible = eligible.len(),
            "Scheduling decision"
        );
        Ok(decision)
    }

    /// Index into `eligible` (non-empty, sorted by name).
    fn pick(&self, request: &LabInstanceRequest, eligible: &[Candidate<'_>]) -> usize {
        match self.config.strategy {
            SchedulingStrategy::BestFit => first_by(eligible, |a, b| a.score > b.score),
            SchedulingStrategy::LeastUtilized => first_by(eligible, |a, b| {
                a.worker.status.capacity.utilization() < b.worker.status.capacity.utilization()
            }),
            SchedulingStrategy::LeastLabs => {
                first_by(eligible, |a, b| a.worker.hosted_labs() < b.worker.hosted_labs())
            }
            SchedulingStrategy::RoundRobin => {
                let mut counters = self.round_robin.lock().unwrap_or_else(|e| e.into_inner());
                let counter = counters
                    .entry(Self::track_key(request).to_string())
                    .or_insert(0);
                let index = *counter % eligible.len();
                *counter = counter.wrapping_add(1);
                index
            }
            SchedulingStrategy::Random => rand::rng().random_range(0..eligible.len()),
        }
    }
}

/// Index of the best candidate under `better`. Strict comparison keeps the
/// first (by name) of tied candidates.
fn first_by(
    eligible: &[Candidate<'_>],
    better: impl Fn(&Candidate<'_>, &Candidate<'_>) -> bool,
) -> usize {
    let mut best = 0;
    for (i, candidate) in eligible.iter().enumerate().skip(1) {
        if better(candidate, &eligible[best]) {
            best = i;
        }
    }
    best
}

impl Default for WorkerSchedulerService {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lab_instance::tests::spec;
    use crate::resources::pool::tests::pool_spec;
    use crate::resources::{
        InstanceType, LabInstancePhase, ObjectMeta, WorkerPhase, POOL_LABEL,
    };
    use crate::scheduler::scoring::tests::serving_worker;
    use chrono::Utc;
    use proptest::prelude::*;
    use rstest::rstest;

    fn request(instance_type: InstanceType) -> LabInstanceRequest {
        LabInstanceRequest::create("labs", "lab-1", spec(instance_type), Utc::now()).unwrap()
    }

    fn service(strategy: SchedulingStrategy) -> WorkerSchedulerService {
        WorkerSchedulerService::new(SchedulerConfig {
            strategy,
            ..SchedulerConfig::default()
        })
    }

    #[rstest]
    #[case::best_fit(SchedulingStrategy::BestFit)]
    #[case::least_utilized(SchedulingStrategy::LeastUtilized)]
    #[case::least_labs(SchedulingStrategy::LeastLabs)]
    #[case::round_robin(SchedulingStrategy::RoundRobin)]
    #[case::random(SchedulingStrategy::Random)]
    fn test_single_eligible_worker_always_chosen(#[case] strategy: SchedulingStrategy) {
        let workers = vec![
            serving_worker("w-a", WorkerPhase::Failed, 0.0),
            serving_worker("w-b", WorkerPhase::Starting, 0.0),
            serving_worker("w-c", WorkerPhase::Active, 30.0),
            serving_worker("w-d", WorkerPhase::Active, 4.0),
        ];

        let svc = service(strategy);
        for _ in 0..5 {
            let decision = svc
                .schedule_lab_instance(&request(InstanceType::Container), &workers)
                .unwrap();
            assert_eq!(decision.worker.name(), "w-d");
            assert_eq!(decision.candidates_evaluated, 2);
            assert!(decision.score > 0.0);
        }
    }

    #[test]
    fn test_round_robin_alternates_per_track() {
        let workers = vec![
            serving_worker("w-1", WorkerPhase::Ready, 0.0),
            serving_worker("w-2", WorkerPhase::Ready, 0.0),
        ];
        let svc = service(SchedulingStrategy::RoundRobin);
        let lab = request(InstanceType::Container);

        let picks: Vec<String> = (0..4)
            .map(|_| {
                svc.schedule_lab_instance(&lab, &workers)
                    .unwrap()
                    .worker
                    .name()
                    .to_string()
            })
            .collect();
        assert_eq!(picks, vec!["w-1", "w-2", "w-1", "w-2"]);

        // Other tracks keep their own position.
        let mut untracked = request(InstanceType::Container);
        untracked.spec.track = None;
        let first = svc.schedule_lab_instance(&untracked, &workers).unwrap();
        assert_eq!(first.worker.name(), "w-1");
    }

    #[test]
    fn test_off_track_worker_is_used_at_a_lower_score() {
        let svc = WorkerSchedulerService::default();
        let mut lab = request(InstanceType::Container);
        lab.spec.track = Some("ccnp".to_string());

        let ccna = serving_worker("w-1", WorkerPhase::Ready, 0.0);
        let decision = svc
            .schedule_lab_instance(&lab, std::slice::from_ref(&ccna))
            .unwrap();
        assert_eq!(decision.worker.name(), "w-1");

        let mut ccnp = serving_worker("w-2", WorkerPhase::Ready, 0.0);
        ccnp.spec.track = "ccnp".to_string();
        let on_track = score_worker(svc.config(), &ccnp, &lab);
        assert!(decision.score < on_track);
        assert!((on_track - decision.score - svc.config().weights.track).abs() < 1e-9);

        // With both available the track bonus decides.
        let decision = svc.schedule_lab_instance(&lab, &[ccna, ccnp]).unwrap();
        assert_eq!(decision.worker.name(), "w-2");
    }

    #[test]
    fn test_best_fit_prefers_idle_worker() {
        let workers = vec![
            serving_worker("w-1", WorkerPhase::Active, 20.0),
            serving_worker("w-2", WorkerPhase::Ready, 1.0),
        ];
        let decision = service(SchedulingStrategy::BestFit)
            .schedule_lab_instance(&request(InstanceType::Container), &workers)
            .unwrap();
        assert_eq!(decision.worker.name(), "w-2");
    }

    #[test]
    fn test_least_labs() {
        let mut busy = serving_worker("w-1", WorkerPhase::Active, 0.0);
        busy.status.hosted_lab_ids = vec!["lab-a".into(), "lab-b".into()];
        let mut light = serving_worker("w-2", WorkerPhase::Active, 10.0);
        light.status.hosted_lab_ids = vec!["lab-c".into()];

        let decision = service(SchedulingStrategy::LeastLabs)
            .schedule_lab_instance(&request(InstanceType::Container), &[busy, light])
            .unwrap();
        assert_eq!(decision.worker.name(), "w-2");
    }

    #[test]
    fn test_failure_reasons_are_specific() {
        let svc = WorkerSchedulerService::default();
        let lab = request(InstanceType::SimulatedNetwork);

        assert_eq!(
            svc.schedule_lab_instance(&lab, &[]),
            Err(SchedulingFailure::NoWorkersAvailable)
        );

        let booting = serving_worker("w-1", WorkerPhase::Licensing, 0.0);
        assert_eq!(
            svc.schedule_lab_instance(&lab, &[booting]),
            Err(SchedulingFailure::WorkerNotReady)
        );

        let mut unlicensed = serving_worker("w-1", WorkerPhase::ReadyUnlicensed, 0.0);
        unlicensed.status.hypervisor.licensed = false;
        assert_eq!(
            svc.schedule_lab_instance(&lab, std::slice::from_ref(&unlicensed)),
            Err(SchedulingFailure::WorkerNotLicensed)
        );
        assert!(svc
            .schedule_lab_instance(&request(InstanceType::Container), &[unlicensed])
            .is_ok());

        let full = serving_worker("w-1", WorkerPhase::Active, 30.0);
        assert_eq!(
            svc.schedule_lab_instance(&lab, &[full]),
            Err(SchedulingFailure::NoCapacityAvailable)
        );
    }

    #[test]
    fn test_licensing_can_be_disabled() {
        let svc = WorkerSchedulerService::new(SchedulerConfig {
            licensing_required: false,
            ..SchedulerConfig::default()
        });
        let mut unlicensed = serving_worker("w-1", WorkerPhase::ReadyUnlicensed, 0.0);
        unlicensed.status.hypervisor.licensed = false;
        assert!(svc
            .schedule_lab_instance(&request(InstanceType::SimulatedNetwork), &[unlicensed])
            .is_ok());
    }

    #[test]
    fn test_rejects_unschedulable_requests() {
        let svc = WorkerSchedulerService::default();
        let workers = vec![serving_worker("w-1", WorkerPhase::Ready, 0.0)];

        let mut assigned = request(InstanceType::Container);
        assigned.status.worker_ref = Some(workers[0].id().clone());
        assert_eq!(
            svc.schedule_lab_instance(&assigned, &workers),
            Err(SchedulingFailure::InvalidRequest("already assigned".to_string()))
        );

        let mut running = request(InstanceType::Container);
        running.status.lifecycle.phase = LabInstancePhase::Running;
        assert!(matches!(
            svc.schedule_lab_instance(&running, &workers),
            Err(SchedulingFailure::InvalidRequest(_))
        ));

        let mut bad_vm = request(InstanceType::Vm);
        bad_vm.spec.resources.memory_mb = 0;
        assert!(matches!(
            svc.schedule_lab_instance(&bad_vm, &workers),
            Err(SchedulingFailure::InvalidLabType(_))
        ));
    }

    fn pool(name: &str, ready: u32, utilization: f64) -> WorkerPool {
        let meta = ObjectMeta::new("workers", name, Utc::now()).unwrap();
        let mut pool = WorkerPool::new(meta, pool_spec("ccna")).unwrap();
        pool.status.lifecycle.phase = WorkerPoolPhase::Ready;
        pool.status.ready_workers = ready;
        pool.status.capacity.ready_workers = ready;
        pool.status.capacity.avg_cpu_utilization = utilization;
        pool.status.capacity.avg_memory_utilization = utilization;
        pool
    }

    fn member(name: &str, pool: &str) -> Worker {
        let mut worker = serving_worker(name, WorkerPhase::Ready, 0.0);
        worker.metadata.labels.insert(POOL_LABEL.to_string(), pool.to_string());
        worker
    }

    #[test]
    fn test_pool_ranking() {
        let svc = WorkerSchedulerService::default();
        let lab = request(InstanceType::Container);

        // 0.5 * 4 = 2.0 beats 0.9 * 2 = 1.8.
        let pools = vec![pool("pool-a", 2, 0.1), pool("pool-b", 4, 0.5)];
        assert_eq!(svc.select_pool(&lab, &pools).unwrap().name(), "pool-b");

        let mut draining = pool("pool-c", 10, 0.0);
        draining.status.lifecycle.phase = WorkerPoolPhase::Draining;
        let mut ccnp = pool("pool-d", 10, 0.0);
        ccnp.spec.track = "ccnp".to_string();
        let pools = vec![draining, ccnp, pool("pool-a", 1, 0.9)];
        assert_eq!(svc.select_pool(&lab, &pools).unwrap().name(), "pool-a");
    }

    #[test]
    fn test_schedule_in_pool_uses_members_only() {
        let svc = WorkerSchedulerService::default();
        let lab = request(InstanceType::Container);
        let pools = vec![pool("pool-a", 1, 0.1)];
        let workers = vec![member("w-1", "pool-z"), member("w-2", "pool-a")];

        let decision = svc.schedule_in_pool(&lab, &pools, &workers).unwrap();
        assert_eq!(decision.worker.name(), "w-2");
        assert_eq!(decision.pool.as_ref().map(|p| p.name()), Some("pool-a"));

        let mut ccnp_lab = request(InstanceType::Container);
        ccnp_lab.spec.track = Some("ccnp".to_string());
        assert_eq!(
            svc.schedule_in_pool(&ccnp_lab, &pools, &workers),
            Err(SchedulingFailure::NoMatchingTrack("ccnp".to_string()))
        );

        let idle_pools = vec![pool("pool-a", 0, 0.0)];
        assert_eq!(
            svc.schedule_in_pool(&lab, &idle_pools, &workers),
            Err(SchedulingFailure::WorkerNotReady)
        );
    }

    proptest! {
        #[test]
        fn prop_only_eligible_worker_is_chosen(
            strategy_index in 0usize..5,
            excluded_load in 26.0f64..32.0,
            chosen_load in 0.0f64..20.0,
            others in 0usize..6,
        ) {
            let strategy = SchedulingStrategy::ALL[strategy_index];
            let mut workers: Vec<Worker> = (0..others)
                .map(|i| serving_worker(&format!("w-{i}"), WorkerPhase::Active, excluded_load))
                .collect();
            workers.push(serving_worker("w-target", WorkerPhase::Ready, chosen_load));

            let decision = service(strategy)
                .schedule_lab_instance(&request(InstanceType::Container), &workers)
                .unwrap();
            prop_assert_eq!(decision.worker.name(), "w-target");
        }
    }
}
