//! External collaborators: cloud provider, lab hypervisor, event sink.
//!
//! Each is an async trait injected as `Arc<dyn ...>`, with an in-memory mock
//! alongside for tests and local runs.

pub mod cloud;
pub mod events;
pub mod hypervisor;

pub use cloud::{CloudProvider, InstanceInfo, InstanceState, MockCloudProvider};
pub use events::{publish_best_effort, EventPublisher, RecordingPublisher, TracingPublisher};
pub use hypervisor::{
    HypervisorClient, HypervisorSession, LabInfo, LabState, LicenseState, LicenseStatus,
    MockHypervisor, SessionManager, SystemInformation, SystemStats,
};
