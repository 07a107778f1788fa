//! LabInstanceRequest: a user's request for a time-boxed lab.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use labfleet_id::ResourceId;
use labfleet_reconcile::{Phase, StateMachine};
use serde::{Deserialize, Serialize};

use super::{Lifecycle, ObjectMeta, Resource, ResourceSpec, ResourceStatus};
use crate::error::ValidationError;

/// Longest lab a user may request.
pub const MAX_DURATION_MINUTES: u32 = 7 * 24 * 60;

pub type LabInstanceRequest = Resource<LabInstanceSpec>;

// =============================================================================
// Phase
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LabInstancePhase {
    #[default]
    Pending,
    Scheduling,
    Provisioning,
    Running,
    Stopping,
    Completed,
    Failed,
    Expired,
}

impl Phase for LabInstancePhase {
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Scheduling,
        Self::Provisioning,
        Self::Running,
        Self::Stopping,
        Self::Completed,
        Self::Failed,
        Self::Expired,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduling => "scheduling",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for LabInstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static LAB_INSTANCE_MACHINE: LazyLock<StateMachine<LabInstancePhase>> = LazyLock::new(|| {
    use LabInstancePhase::*;
    StateMachine::new(
        LabInstanceSpec::KIND,
        &[
            (Pending, &[Scheduling, Provisioning, Failed, Expired]),
            (Scheduling, &[Pending, Provisioning, Failed, Expired]),
            (Provisioning, &[Running, Stopping, Failed]),
            (Running, &[Stopping, Failed]),
            (Stopping, &[Completed, Failed]),
        ],
    )
});

// =============================================================================
// Spec
// =============================================================================

/// Kind of environment a lab runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    /// A simulated network topology on the lab hypervisor.
    SimulatedNetwork,
    Container,
    Vm,
    /// Simulated network plus attached VMs.
    Hybrid,
}

impl InstanceType {
    /// Needs a worker whose hypervisor can run simulated networks.
    pub fn needs_simulated_network(&self) -> bool {
        matches!(self, Self::SimulatedNetwork | Self::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulatedNetwork => "simulated_network",
            Self::Container => "container",
            Self::Vm => "vm",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Resources a lab may consume on its worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub storage_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabInstanceSpec {
    /// Lab topology template to instantiate.
    pub template: String,

    pub duration_minutes: u32,

    pub requester: String,

    pub instance_type: InstanceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,

    /// Earliest start; `None` means as soon as possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resources: ResourceLimits,
}

impl LabInstanceSpec {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.duration_minutes))
    }
}

impl ResourceSpec for LabInstanceSpec {
    const KIND: &'static str = "lab_instance";

    type Status = LabInstanceStatus;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.template.trim().is_empty() {
            return Err(ValidationError::Required { field: "template" });
        }
        if self.requester.trim().is_empty() {
            return Err(ValidationError::Required { field: "requester" });
        }
        if self.duration_minutes == 0 || self.duration_minutes > MAX_DURATION_MINUTES {
            return Err(ValidationError::out_of_range(
                "duration_minutes",
                format!("must be between 1 and {MAX_DURATION_MINUTES}"),
            ));
        }
        if self.track.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ValidationError::Required { field: "track" });
        }

        let limits = &self.resources;
        if !limits.cpu_cores.is_finite() || limits.cpu_cores < 0.0 {
            return Err(ValidationError::out_of_range(
                "resources.cpu_cores",
                "must be a non-negative number",
            ));
        }
        if matches!(self.instance_type, InstanceType::Vm | InstanceType::Hybrid)
            && (limits.cpu_cores == 0.0 || limits.memory_mb == 0)
        {
            return Err(ValidationError::InvalidLabType(format!(
                "{} labs must declare cpu and memory limits",
                self.instance_type.as_str()
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Resources reserved for a lab on its worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub storage_gb: u64,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabInstanceStatus {
    #[serde(flatten)]
    pub lifecycle: Lifecycle<LabInstancePhase>,

    /// Worker chosen by the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_ref: Option<ResourceId>,

    /// Lab id on the worker's hypervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ResourceAllocation>,
}

impl ResourceStatus for LabInstanceStatus {
    type Phase = LabInstancePhase;

    fn state_machine() -> &'static StateMachine<LabInstancePhase> {
        &LAB_INSTANCE_MACHINE
    }

    fn lifecycle(&self) -> &Lifecycle<LabInstancePhase> {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<LabInstancePhase> {
        &mut self.lifecycle
    }

    fn is_transitional(&self) -> bool {
        match self.lifecycle.phase {
            LabInstancePhase::Pending => self.worker_ref.is_some(),
            LabInstancePhase::Scheduling
            | LabInstancePhase::Provisioning
            | LabInstancePhase::Stopping => true,
            LabInstancePhase::Running
            | LabInstancePhase::Completed
            | LabInstancePhase::Failed
            | LabInstancePhase::Expired => false,
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

impl Resource<LabInstanceSpec> {
    /// Create a request in PENDING.
    pub fn create(
        namespace: &str,
        name: &str,
        spec: LabInstanceSpec,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        Resource::new(ObjectMeta::new(namespace, name, now)?, spec)
    }

    /// Earliest moment the lab may start.
    pub fn window_opens_at(&self) -> DateTime<Utc> {
        self.spec.scheduled_start.unwrap_or(self.metadata.created_at)
    }

    /// After this moment an unscheduled request is pointless.
    pub fn window_closes_at(&self) -> DateTime<Utc> {
        self.window_opens_at() + self.spec.duration()
    }

    pub fn is_assigned(&self) -> bool {
        self.status.worker_ref.is_some()
    }

    /// Phase allows assignment and no worker is set yet.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self.phase(),
            LabInstancePhase::Pending | LabInstancePhase::Scheduling
        ) && !self.is_assigned()
    }

    /// When a running lab must be stopped.
    pub fn run_ends_at(&self) -> Option<DateTime<Utc>> {
        self.status.started_at.map(|s| s + self.spec.duration())
    }
}
