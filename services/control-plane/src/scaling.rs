//! Pool autoscaling decisions.
//!
//! Pure functions of the pool's scaling config, its aggregated capacity and
//! the clock. The pool controller acts on the decision; nothing here has
//! side effects.
//!
//! Rules:
//! - The target moves by exactly one worker per evaluation.
//! - A count outside `[min_workers, max_workers]` moves one step toward the
//!   violated bound regardless of load, cooldown or allowed hours.
//! - Threshold moves need the direction's cooldown to have elapsed and the
//!   current hour to be inside the allowed-hours window.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use labfleet_events::ScaleDirection;

use crate::resources::{ScalingConfig, ScalingPolicy, WorkerPoolStatus};

/// What the pool controller should do this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    Hold,
    Scale {
        direction: ScaleDirection,
        from: u32,
        to: u32,
        reason: String,
    },
}

/// Scale evaluation for one pool.
#[derive(Debug, Clone, Copy)]
pub struct Autoscaler<'a> {
    config: &'a ScalingConfig,
}

impl<'a> Autoscaler<'a> {
    pub fn new(config: &'a ScalingConfig) -> Self {
        Self { config }
    }

    /// Whether `now` falls in the allowed-hours window (always, if unset).
    pub fn in_allowed_hours(&self, now: DateTime<Utc>) -> bool {
        self.config
            .allowed_hours
            .is_none_or(|hours| hours.contains(now.hour()))
    }

    fn cooldown_elapsed(
        last: Option<DateTime<Utc>>,
        cooldown_secs: u64,
        now: DateTime<Utc>,
    ) -> bool {
        last.is_none_or(|last| {
            labfleet_reconcile::elapsed_since(last, now) >= Duration::from_secs(cooldown_secs)
        })
    }

    /// Load-based reason to add a worker, ignoring gates.
    pub fn scale_up_reason(&self, status: &WorkerPoolStatus) -> Option<String> {
        let c = &status.capacity;
        if c.ready_workers == 0 {
            return Some("no ready workers".to_string());
        }
        if c.avg_cpu_utilization > self.config.cpu_scale_up_threshold {
            return Some(format!(
                "cpu utilization {:.2} above {:.2}",
                c.avg_cpu_utilization, self.config.cpu_scale_up_threshold
            ));
        }
        if c.avg_memory_utilization > self.config.memory_scale_up_threshold {
            return Some(format!(
                "memory utilization {:.2} above {:.2}",
                c.avg_memory_utilization, self.config.memory_scale_up_threshold
            ));
        }
        if c.avg_labs_per_worker > f64::from(self.config.max_labs_per_worker) {
            return Some(format!(
                "{:.1} labs per worker above {}",
                c.avg_labs_per_worker, self.config.max_labs_per_worker
            ));
        }
        None
    }

    /// Load-based reason to remove a worker, ignoring gates.
    pub fn scale_down_reason(&self, status: &WorkerPoolStatus) -> Option<String> {
        let c = &status.capacity;
        let underused = c.ready_workers > 1
            && c.avg_cpu_utilization < self.config.cpu_scale_down_threshold
            && c.avg_memory_utilization < self.config.memory_scale_down_threshold
            && c.avg_labs_per_worker < f64::from(self.config.min_labs_per_worker);
        underused.then(|| {
            format!(
                "underutilized: cpu {:.2}, memory {:.2}, {:.1} labs per worker",
                c.avg_cpu_utilization, c.avg_memory_utilization, c.avg_labs_per_worker
            )
        })
    }

    pub fn should_scale_up(&self, status: &WorkerPoolStatus, now: DateTime<Utc>) -> bool {
        self.config.policy == ScalingPolicy::Threshold
            && status.capacity.current_workers < self.config.max_workers
            && self.in_allowed_hours(now)
            && Self::cooldown_elapsed(
                status.last_scale_up_at,
                self.config.scale_up_cooldown_secs,
                now,
            )
            && self.scale_up_reason(status).is_some()
    }

    pub fn should_scale_down(&self, status: &WorkerPoolStatus, now: DateTime<Utc>) -> bool {
        self.config.policy == ScalingPolicy::Threshold
            && status.capacity.current_workers > self.config.min_workers
            && self.in_allowed_hours(now)
            && Self::cooldown_elapsed(
                status.last_scale_down_at,
                self.config.scale_down_cooldown_secs,
                now,
            )
            && self.scale_down_reason(status).is_some()
    }

    /// Desired worker count after this evaluation.
    pub fn get_target_worker_count(&self, status: &WorkerPoolStatus, now: DateTime<Utc>) -> u32 {
        match self.decide(status, now) {
            ScaleDecision::Hold => status.capacity.current_workers,
            ScaleDecision::Scale { to, .. } => to,
        }
    }

    pub fn decide(&self, status: &WorkerPoolStatus, now: DateTime<Utc>) -> ScaleDecision {
        let current = status.capacity.current_workers;
        let (min, max) = (self.config.min_workers, self.config.max_workers);
        let up = |reason: String| ScaleDecision::Scale {
            direction: ScaleDirection::Up,
            from: current,
            to: current + 1,
            reason,
        };
        let down = |reason: String| ScaleDecision::Scale {
            direction: ScaleDirection::Down,
            from: current,
            to: current.saturating_sub(1),
            reason,
        };

        if current < min {
            return up(format!("{current} workers below minimum {min}"));
        }
        if current > max {
            return down(format!("{current} workers above maximum {max}"));
        }

        match self.config.policy {
            ScalingPolicy::Manual if current > min => {
                down(format!("manual policy converging on {min} workers"))
            }
            ScalingPolicy::Manual => ScaleDecision::Hold,
            ScalingPolicy::Threshold => {
                if self.should_scale_up(status, now) {
                    self.scale_up_reason(status).map_or(ScaleDecision::Hold, up)
                } else if self.should_scale_down(status, now) {
                    self.scale_down_reason(status)
                        .map_or(ScaleDecision::Hold, down)
                } else {
                    ScaleDecision::Hold
                }
            }
        }
    }
}
