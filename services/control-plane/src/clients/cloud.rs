//! Cloud VM provisioning interface and mock implementation.
//!
//! The provider abstracts the VM lifecycle of a worker:
//! - Launching an instance from a [`CloudInstanceConfig`]
//! - Polling its state and addresses
//! - Stop/start/terminate
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExternalError;
use crate::resources::CloudInstanceConfig;

/// Delay between polls in the provided `wait_for_*` methods.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Provider-reported instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance details returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl InstanceInfo {
    pub fn has_address(&self) -> bool {
        self.public_ip.is_some() || self.private_ip.is_some()
    }
}

/// Cloud provisioning interface.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launch an instance named `name`.
    async fn provision(
        &self,
        name: &str,
        config: &CloudInstanceConfig,
    ) -> Result<InstanceInfo, ExternalError>;

    /// Current state; [`ExternalError::NotFound`] when the id is unknown.
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, ExternalError>;

    async fn start(&self, instance_id: &str) -> Result<(), ExternalError>;

    async fn stop(&self, instance_id: &str) -> Result<(), ExternalError>;

    /// Idempotent: terminating a terminated instance succeeds.
    async fn terminate(&self, instance_id: &str) -> Result<(), ExternalError>;

    /// Instances whose tags contain every entry of `filters`.
    async fn list(
        &self,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<InstanceInfo>, ExternalError>;

    /// Poll until the instance is running.
    async fn wait_for_running(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceInfo, ExternalError> {
        let poll = async {
            loop {
                let info = self.get_instance(instance_id).await?;
                match info.state {
                    InstanceState::Running => return Ok(info),
                    InstanceState::Stopped
                    | InstanceState::Terminating
                    | InstanceState::Terminated => {
                        return Err(ExternalError::Cloud(format!(
                            "instance {instance_id} is {} while waiting for running",
                            info.state
                        )));
                    }
                    InstanceState::Pending | InstanceState::Stopping => {
                        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
                    }
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ExternalError::Timeout(timeout))?
    }

    /// Poll until the instance is terminated or gone.
    async fn wait_for_terminated(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<(), ExternalError> {
        let poll = async {
            loop {
                match self.get_instance(instance_id).await {
                    Ok(info) if info.state == InstanceState::Terminated => return Ok(()),
                    Ok(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ExternalError::Timeout(timeout))?
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Mock provider for testing and development.
///
/// Transitional states advance one step per `get_instance` call:
/// pending -> running, stopping -> stopped, terminating -> terminated.
pub struct MockCloudProvider {
    counter: AtomicU64,
    instances: Mutex<BTreeMap<String, InstanceInfo>>,
    fail_provision: AtomicBool,
    fail_boot: AtomicBool,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            instances: Mutex::new(BTreeMap::new()),
            fail_provision: AtomicBool::new(false),
            fail_boot: AtomicBool::new(false),
        }
    }

    /// Create a mock provider that rejects every launch.
    pub fn failing() -> Self {
        let provider = Self::new();
        provider.set_fail_provision(true);
        provider
    }

    pub fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    /// Launched instances stop instead of reaching running.
    pub fn set_fail_boot(&self, fail: bool) {
        self.fail_boot.store(fail, Ordering::SeqCst);
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.lock().get(instance_id).cloned()
    }

    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(info) = self.lock().get_mut(instance_id) {
            info.state = state;
        }
    }

    /// Instances not yet terminated.
    pub fn live_instances(&self) -> usize {
        self.lock()
            .values()
            .filter(|i| i.state != InstanceState::Terminated)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InstanceInfo>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn not_found(instance_id: &str) -> ExternalError {
        ExternalError::NotFound(format!("instance {instance_id}"))
    }
}

impl Default for MockCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn provision(
        &self,
        name: &str,
        config: &CloudInstanceConfig,
    ) -> Result<InstanceInfo, ExternalError> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(ExternalError::Cloud(format!(
                "insufficient capacity for {} in {}",
                config.instance_type, config.region
            )));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("i-{:016x}", n);
        let mut tags = config.tags.clone();
        tags.insert("Name".to_string(), name.to_string());

        let info = InstanceInfo {
            instance_id: instance_id.clone(),
            state: InstanceState::Pending,
            public_ip: None,
            private_ip: None,
            launched_at: Some(Utc::now()),
            tags,
        };

        info!(
            instance_id = %instance_id,
            name = %name,
            image_id = %config.image_id,
            "[MOCK] Provisioning instance"
        );

        self.lock().insert(instance_id, info.clone());
        Ok(info)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, ExternalError> {
        let fail_boot = self.fail_boot.load(Ordering::SeqCst);
        let mut instances = self.lock();
        let info = instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;

        match info.state {
            InstanceState::Pending if fail_boot => info.state = InstanceState::Stopped,
            InstanceState::Pending => {
                let n = address_octet(instance_id);
                info.state = InstanceState::Running;
                info.private_ip = Some(format!("10.0.0.{n}"));
                info.public_ip = Some(format!("198.51.100.{n}"));
            }
            InstanceState::Stopping => info.state = InstanceState::Stopped,
            InstanceState::Terminating => info.state = InstanceState::Terminated,
            InstanceState::Running | InstanceState::Stopped | InstanceState::Terminated => {}
        }

        Ok(info.clone())
    }

    async fn start(&self, instance_id: &str) -> Result<(), ExternalError> {
        let mut instances = self.lock();
        let info = instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;
        if info.state == InstanceState::Terminated {
            return Err(ExternalError::Cloud(format!(
                "instance {instance_id} is terminated"
            )));
        }
        info!(instance_id = %instance_id, "[MOCK] Starting instance");
        info.state = InstanceState::Pending;
        Ok(())
    }

    async fn stop(&self, instance_id: &str) -> Result<(), ExternalError> {
        let mut instances = self.lock();
        let info = instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;
        if matches!(info.state, InstanceState::Pending | InstanceState::Running) {
            info!(instance_id = %instance_id, "[MOCK] Stopping instance");
            info.state = InstanceState::Stopping;
        }
        Ok(())
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ExternalError> {
        let mut instances = self.lock();
        let info = instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;
        if info.state != InstanceState::Terminated {
            info!(instance_id = %instance_id, "[MOCK] Terminating instance");
            info.state = InstanceState::Terminating;
        }
        Ok(())
    }

    async fn list(
        &self,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<InstanceInfo>, ExternalError> {
        Ok(self
            .lock()
            .values()
            .filter(|i| filters.iter().all(|(k, v)| i.tags.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

/// Last octet for a mock address, derived from the instance counter.
fn address_octet(instance_id: &str) -> u64 {
    let n = u64::from_str_radix(instance_id.trim_start_matches("i-"), 16).unwrap_or(0);
    n % 250 + 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::worker::tests::worker_spec;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let cloud = MockCloudProvider::new();
        let config = worker_spec("ccna").cloud;

        let info = cloud.provision("w-1", &config).await.unwrap();
        assert_eq!(info.state, InstanceState::Pending);
        assert_eq!(info.tags.get("Name").map(String::as_str), Some("w-1"));

        let running = cloud.get_instance(&info.instance_id).await.unwrap();
        assert_eq!(running.state, InstanceState::Running);
        assert!(running.has_address());

        cloud.terminate(&info.instance_id).await.unwrap();
        cloud.terminate(&info.instance_id).await.unwrap();
        cloud
            .wait_for_terminated(&info.instance_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cloud.live_instances(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_running() {
        let cloud = MockCloudProvider::new();
        let info = cloud
            .provision("w-1", &worker_spec("ccna").cloud)
            .await
            .unwrap();
        let running = cloud
            .wait_for_running(&info.instance_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(running.state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_wait_for_running_reports_boot_failure() {
        let cloud = MockCloudProvider::new();
        cloud.set_fail_boot(true);
        let info = cloud
            .provision("w-1", &worker_spec("ccna").cloud)
            .await
            .unwrap();
        let err = cloud
            .wait_for_running(&info.instance_id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalError::Cloud(_)));
    }

    #[tokio::test]
    async fn test_failing_provider() {
        let cloud = MockCloudProvider::failing();
        assert!(cloud
            .provision("w-1", &worker_spec("ccna").cloud)
            .await
            .is_err());
        assert!(cloud.get_instance("i-missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_tag() {
        let cloud = MockCloudProvider::new();
        let mut config = worker_spec("ccna").cloud;
        config.tags.insert("pool".to_string(), "ccna".to_string());
        cloud.provision("w-1", &config).await.unwrap();
        cloud
            .provision("w-2", &worker_spec("ccna").cloud)
            .await
            .unwrap();

        let filters = BTreeMap::from([("pool".to_string(), "ccna".to_string())]);
        assert_eq!(cloud.list(&filters).await.unwrap().len(), 1);
        assert_eq!(cloud.list(&BTreeMap::new()).await.unwrap().len(), 2);
    }
}
