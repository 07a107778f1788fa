//! Event type definitions for control-plane events.
//!
//! Each event type has a corresponding payload struct with the event-specific data.
//! Phases are carried as their stable lowercase names so consumers do not need
//! the control-plane resource model.

use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Lab instance
    pub const LAB_INSTANCE_CREATED: &str = "lab_instance.created";
    pub const LAB_INSTANCE_PHASE_CHANGED: &str = "lab_instance.phase_changed";
    pub const LAB_INSTANCE_SCHEDULED: &str = "lab_instance.scheduled";

    // Worker
    pub const WORKER_PHASE_CHANGED: &str = "worker.phase_changed";

    // Worker pool
    pub const WORKER_POOL_PHASE_CHANGED: &str = "worker_pool.phase_changed";
    pub const WORKER_POOL_SCALED: &str = "worker_pool.scaled";
}

// =============================================================================
// Enums
// =============================================================================

/// Direction of a pool scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleDirection::Up => write!(f, "up"),
            ScaleDirection::Down => write!(f, "down"),
        }
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Payload for every `*.phase_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChangedPayload {
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabInstanceCreatedPayload {
    pub template: String,
    pub requester: String,
    pub instance_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabInstanceScheduledPayload {
    /// `namespace/name` of the chosen worker.
    pub worker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    pub strategy: String,
    pub score: f64,
    pub candidates_evaluated: usize,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolScaledPayload {
    pub direction: ScaleDirection,
    pub from_workers: u32,
    pub to_workers: u32,
    pub reason: String,
    /// Worker created or marked for removal.
    pub worker: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_direction_serialization() {
        assert_eq!(
            serde_json::to_string(&ScaleDirection::Up).unwrap(),
            "\"up\""
        );
        assert_eq!(ScaleDirection::Down.to_string(), "down");
    }

    #[test]
    fn test_scheduled_payload_omits_missing_pool() {
        let payload = LabInstanceScheduledPayload {
            worker: "workers/w-1".to_string(),
            pool: None,
            strategy: "best_fit".to_string(),
            score: 0.9,
            candidates_evaluated: 3,
            latency_ms: 1,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("pool").is_none());
        assert_eq!(json["candidates_evaluated"], 3);
    }
}
