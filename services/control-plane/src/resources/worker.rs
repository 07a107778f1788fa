//! Worker: one cloud VM running the lab hypervisor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use labfleet_reconcile::{Phase, StateMachine};
use serde::{Deserialize, Serialize};

use super::{Lifecycle, ObjectMeta, Resource, ResourceLimits, ResourceSpec, ResourceStatus};
use crate::error::ValidationError;

pub type Worker = Resource<WorkerSpec>;

// =============================================================================
// Phase
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    #[default]
    Pending,
    ProvisioningCloud,
    CloudReady,
    Starting,
    Licensing,
    ReadyUnlicensed,
    Ready,
    Active,
    Draining,
    Unlicensing,
    Stopping,
    TerminatingCloud,
    Terminated,
    Failed,
}

impl WorkerPhase {
    /// Phases in which the worker can accept labs.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::ReadyUnlicensed | Self::Active)
    }

    /// Still being brought up.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::ProvisioningCloud
                | Self::CloudReady
                | Self::Starting
                | Self::Licensing
        )
    }

    /// Somewhere in the shutdown path.
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self,
            Self::Draining | Self::Unlicensing | Self::Stopping | Self::TerminatingCloud
        )
    }
}

impl Phase for WorkerPhase {
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::ProvisioningCloud,
        Self::CloudReady,
        Self::Starting,
        Self::Licensing,
        Self::ReadyUnlicensed,
        Self::Ready,
        Self::Active,
        Self::Draining,
        Self::Unlicensing,
        Self::Stopping,
        Self::TerminatingCloud,
        Self::Terminated,
        Self::Failed,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ProvisioningCloud => "provisioning_cloud",
            Self::CloudReady => "cloud_ready",
            Self::Starting => "starting",
            Self::Licensing => "licensing",
            Self::ReadyUnlicensed => "ready_unlicensed",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Unlicensing => "unlicensing",
            Self::Stopping => "stopping",
            Self::TerminatingCloud => "terminating_cloud",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static WORKER_MACHINE: LazyLock<StateMachine<WorkerPhase>> = LazyLock::new(|| {
    use WorkerPhase::*;
    StateMachine::new(
        WorkerSpec::KIND,
        &[
            (Pending, &[ProvisioningCloud, Terminated, Failed]),
            (ProvisioningCloud, &[CloudReady, TerminatingCloud, Failed]),
            (CloudReady, &[Starting, TerminatingCloud, Failed]),
            (Starting, &[ReadyUnlicensed, Licensing, Stopping, Failed]),
            (Licensing, &[Ready, ReadyUnlicensed, Failed]),
            (ReadyUnlicensed, &[Licensing, Active, Draining, Failed]),
            (Ready, &[Active, Draining, Failed]),
            (Active, &[Ready, ReadyUnlicensed, Draining, Failed]),
            (Draining, &[Unlicensing, Stopping, Failed]),
            (Unlicensing, &[Stopping, Failed]),
            (Stopping, &[TerminatingCloud, Failed]),
            (TerminatingCloud, &[Terminated, Failed]),
            (Failed, &[Stopping, TerminatingCloud]),
        ],
    )
});

// =============================================================================
// Spec
// =============================================================================

/// How to launch the worker's cloud VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInstanceConfig {
    pub image_id: String,
    pub instance_type: String,
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,

    #[serde(default)]
    pub security_group_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// How to reach the hypervisor once the VM is up.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default = "default_hypervisor_port")]
    pub port: u16,

    pub username: String,

    pub password: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_token: Option<String>,

    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_hypervisor_port() -> u16 {
    443
}

fn default_verify_tls() -> bool {
    true
}

// Keep credentials out of logs.
impl fmt::Debug for HypervisorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorConfig")
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("license_token", &self.license_token.as_ref().map(|_| "<redacted>"))
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// Lifecycle target set by the owner (user or pool).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerDesiredPhase {
    #[default]
    Ready,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub track: String,
    pub cloud: CloudInstanceConfig,
    pub hypervisor: HypervisorConfig,

    #[serde(default)]
    pub desired_phase: WorkerDesiredPhase,

    #[serde(default)]
    pub auto_license: bool,
}

impl ResourceSpec for WorkerSpec {
    const KIND: &'static str = "worker";

    type Status = WorkerStatus;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.track.trim().is_empty() {
            return Err(ValidationError::Required { field: "track" });
        }
        if self.cloud.image_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "cloud.image_id",
            });
        }
        if self.cloud.instance_type.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "cloud.instance_type",
            });
        }
        if self.cloud.region.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "cloud.region",
            });
        }
        if self.hypervisor.port == 0 {
            return Err(ValidationError::out_of_range(
                "hypervisor.port",
                "must be non-zero",
            ));
        }
        if self.hypervisor.username.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "hypervisor.username",
            });
        }
        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    /// Last state reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub licensed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// A license token has been submitted and not yet accepted or rejected.
    #[serde(default)]
    pub license_requested: bool,
}

/// Reported and reserved resources on a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapacity {
    pub total_cpu: f64,
    pub allocated_cpu: f64,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
    pub total_storage_gb: u64,
    pub allocated_storage_gb: u64,
    pub max_concurrent_labs: u32,
}

fn ratio(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (used / total).clamp(0.0, 1.0)
    }
}

impl WorkerCapacity {
    pub fn cpu_utilization(&self) -> f64 {
        ratio(self.allocated_cpu, self.total_cpu)
    }

    pub fn memory_utilization(&self) -> f64 {
        ratio(self.allocated_memory_mb as f64, self.total_memory_mb as f64)
    }

    pub fn storage_utilization(&self) -> f64 {
        ratio(self.allocated_storage_gb as f64, self.total_storage_gb as f64)
    }

    /// Mean of cpu, memory and storage utilisation.
    pub fn utilization(&self) -> f64 {
        (self.cpu_utilization() + self.memory_utilization() + self.storage_utilization()) / 3.0
    }

    pub fn free_cpu(&self) -> f64 {
        (self.total_cpu - self.allocated_cpu).max(0.0)
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.total_memory_mb.saturating_sub(self.allocated_memory_mb)
    }

    pub fn free_storage_gb(&self) -> u64 {
        self.total_storage_gb.saturating_sub(self.allocated_storage_gb)
    }

    /// Whether `limits` fit in what is left.
    pub fn fits(&self, limits: &ResourceLimits) -> bool {
        limits.cpu_cores <= self.free_cpu()
            && limits.memory_mb <= self.free_memory_mb()
            && limits.storage_gb <= self.free_storage_gb()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub lifecycle: Lifecycle<WorkerPhase>,

    #[serde(default)]
    pub cloud: CloudStatus,

    #[serde(default)]
    pub hypervisor: HypervisorStatus,

    #[serde(default)]
    pub capacity: WorkerCapacity,

    /// Labs currently present on the hypervisor.
    #[serde(default)]
    pub hosted_lab_ids: Vec<String>,

    /// Consecutive failed external calls.
    #[serde(default)]
    pub error_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl ResourceStatus for WorkerStatus {
    type Phase = WorkerPhase;

    fn state_machine() -> &'static StateMachine<WorkerPhase> {
        &WORKER_MACHINE
    }

    fn lifecycle(&self) -> &Lifecycle<WorkerPhase> {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<WorkerPhase> {
        &mut self.lifecycle
    }

    fn is_transitional(&self) -> bool {
        !matches!(
            self.lifecycle.phase,
            WorkerPhase::Ready
                | WorkerPhase::ReadyUnlicensed
                | WorkerPhase::Active
                | WorkerPhase::Failed
                | WorkerPhase::Terminated
        )
    }
}

// =============================================================================
// Operations
// =============================================================================

impl Resource<WorkerSpec> {
    pub fn create(
        meta: ObjectMeta,
        spec: WorkerSpec,
    ) -> Result<Self, ValidationError> {
        Resource::new(meta, spec)
    }

    /// Serving labs.
    pub fn is_ready(&self) -> bool {
        self.phase().is_serving()
    }

    pub fn is_licensed(&self) -> bool {
        self.status.hypervisor.licensed
    }

    pub fn marked_for_termination(&self) -> bool {
        self.spec.desired_phase == WorkerDesiredPhase::Terminated
    }

    pub fn hosted_labs(&self) -> usize {
        self.status.hosted_lab_ids.len()
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.status.cloud.instance_id.as_deref()
    }

    /// `https://<ip>:<port>` once the VM has an address.
    pub fn hypervisor_url(&self) -> Option<String> {
        let ip = self
            .status
            .cloud
            .public_ip
            .as_deref()
            .or(self.status.cloud.private_ip.as_deref())?;
        Some(format!("https://{}:{}", ip, self.spec.hypervisor.port))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn worker_spec(track: &str) -> WorkerSpec {
        WorkerSpec {
            track: track.to_string(),
            cloud: CloudInstanceConfig {
                image_id: "img-hypervisor-2.8".to_string(),
                instance_type: "m5.2xlarge".to_string(),
                region: "eu-west-1".to_string(),
                subnet_id: None,
                security_group_ids: vec!["sg-labs".to_string()],
                key_name: None,
                tags: BTreeMap::new(),
            },
            hypervisor: HypervisorConfig {
                port: 443,
                username: "admin".to_string(),
                password: "hunter2".to_string(),
                license_token: Some("lic-token".to_string()),
                verify_tls: false,
            },
            desired_phase: WorkerDesiredPhase::Ready,
            auto_license: true,
        }
    }

    #[test]
    fn test_capacity_utilization() {
        let cap = WorkerCapacity {
            total_cpu: 8.0,
            allocated_cpu: 4.0,
            total_memory_mb: 16_384,
            allocated_memory_mb: 4_096,
            total_storage_gb: 100,
            allocated_storage_gb: 0,
            max_concurrent_labs: 10,
        };
        assert!((cap.cpu_utilization() - 0.5).abs() < f64::EPSILON);
        assert!((cap.memory_utilization() - 0.25).abs() < f64::EPSILON);
        assert!((cap.utilization() - 0.25).abs() < 1e-9);
        assert!(cap.fits(&ResourceLimits {
            cpu_cores: 4.0,
            memory_mb: 12_288,
            storage_gb: 100
        }));
        assert!(!cap.fits(&ResourceLimits {
            cpu_cores: 4.5,
            memory_mb: 0,
            storage_gb: 0
        }));
    }

    #[test]
    fn test_zero_capacity_is_not_utilized() {
        assert_eq!(WorkerCapacity::default().utilization(), 0.0);
    }

    #[test]
    fn test_hypervisor_url_prefers_public_ip() {
        let meta = ObjectMeta::new("workers", "w-1", Utc::now()).unwrap();
        let mut worker = Worker::create(meta, worker_spec("ccna")).unwrap();
        assert!(worker.hypervisor_url().is_none());

        worker.status.cloud.private_ip = Some("10.0.0.4".to_string());
        assert_eq!(worker.hypervisor_url().as_deref(), Some("https://10.0.0.4:443"));

        worker.status.cloud.public_ip = Some("54.1.2.3".to_string());
        assert_eq!(worker.hypervisor_url().as_deref(), Some("https://54.1.2.3:443"));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let rendered = format!("{:?}", worker_spec("ccna").hypervisor);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("lic-token"));
    }

    #[test]
    fn test_only_terminated_is_terminal() {
        let sm = WorkerStatus::state_machine();
        let terminal: Vec<_> = WorkerPhase::ALL
            .iter()
            .copied()
            .filter(|p| sm.is_terminal(*p))
            .collect();
        assert_eq!(terminal, vec![WorkerPhase::Terminated]);
    }

    #[test]
    fn test_failed_can_reenter_shutdown() {
        let sm = WorkerStatus::state_machine();
        assert!(sm.can_transition_to(WorkerPhase::Failed, WorkerPhase::Stopping));
        assert!(sm.can_transition_to(WorkerPhase::Failed, WorkerPhase::TerminatingCloud));
        assert!(!sm.can_transition_to(WorkerPhase::Failed, WorkerPhase::Ready));
    }
}
