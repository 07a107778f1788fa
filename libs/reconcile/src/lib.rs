//! Reconciliation loop primitives.
//!
//! This library provides the building blocks shared by every labfleet
//! controller:
//!
//! - **State machine**: a per-kind adjacency table that decides which phase
//!   transitions are legal.
//! - **Reconcile result**: the success/error/requeue outcome of one step.
//! - **Clock**: an injectable time source for timeouts and cooldowns.
//! - **Spec hash**: a canonical hash used to detect desired-state changes.
//!
//! # Invariants
//!
//! - Illegal transitions never mutate state
//! - Decisions are deterministic given the same inputs and clock
//! - A reconcile step never blocks waiting on time; it asks to be requeued

mod clock;
mod result;
mod state_machine;

use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

pub use clock::{elapsed_since, phase_timed_out, remaining_until, Clock, ManualClock, SystemClock};
pub use result::ReconcileResult;
pub use state_machine::{Phase, StateMachine, TransitionError, TransitionRecord};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a resource's desired state has changed between
/// two observations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Hash any serializable spec.
    pub fn of<T: Serialize>(spec: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(spec).map(|v| Self::from_json(&v))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Drain selection priority.
///
/// Lower priority values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Member has failed (drain first).
    Failed = 0,

    /// Member is not serving yet.
    NotReady = 1,

    /// Member is serving but idle.
    Idle = 2,

    /// Member is serving workload (drain last).
    Busy = 3,
}

/// Order candidates for draining, first to drain first.
///
/// Ties keep their input order, so callers can pre-sort by a secondary key.
pub fn select_for_drain<T, F>(candidates: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DrainPriority,
{
    let mut with_priority: Vec<_> = candidates
        .into_iter()
        .map(|c| (get_priority(&c), c))
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, c)| c).collect()
}

/// Default watcher polling interval.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Default revisit delay for steady phases.
pub const DEFAULT_STEADY_REQUEUE: Duration = Duration::from_secs(30);

/// Default revisit delay when retrying a failed external call.
pub const DEFAULT_RETRY_REQUEUE: Duration = Duration::from_secs(30);
