//! Scheduler module for lab placement.
//!
//! The scheduler is responsible for:
//! - Scoring serving workers against a pending lab request
//! - Choosing one per the configured strategy, optionally within a pool
//! - Recording the assignment and emitting `lab_instance.scheduled`

mod scoring;
mod service;
mod worker;

pub use scoring::{
    hard_constraint, score_worker, simulated_network_capable, SchedulerConfig,
    SchedulingStrategy, ScoringWeights,
};
pub use service::{SchedulingDecision, SchedulingFailure, WorkerSchedulerService};
pub use worker::{SchedulerWorker, SchedulingStats};
