//! Lab hypervisor interface, session cache and mock implementation.
//!
//! Every hypervisor call is keyed by a bearer token. [`SessionManager`]
//! caches one token per hypervisor URL and re-authenticates when the
//! token's `exp` claim is within the configured leeway.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use labfleet_reconcile::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExternalError;
use crate::resources::{HypervisorConfig, Worker, WorkerCapacity};

/// Refresh tokens this long before they expire.
pub const DEFAULT_TOKEN_LEEWAY: Duration = Duration::from_secs(30);

/// Authenticated handle to one hypervisor.
#[derive(Clone, PartialEq, Eq)]
pub struct HypervisorSession {
    pub url: String,
    pub token: String,
}

impl fmt::Debug for HypervisorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorSession")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabState {
    Defined,
    Starting,
    Booted,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabInfo {
    pub id: String,
    pub title: String,
    pub state: LabState,
    #[serde(default)]
    pub node_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInformation {
    pub version: String,
    pub ready: bool,
}

/// Host resources as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_cpu: f64,
    pub allocated_cpu: f64,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
    pub total_storage_gb: u64,
    pub allocated_storage_gb: u64,
    pub max_concurrent_labs: u32,
}

impl From<SystemStats> for WorkerCapacity {
    fn from(stats: SystemStats) -> Self {
        Self {
            total_cpu: stats.total_cpu,
            allocated_cpu: stats.allocated_cpu,
            total_memory_mb: stats.total_memory_mb,
            allocated_memory_mb: stats.allocated_memory_mb,
            total_storage_gb: stats.total_storage_gb,
            allocated_storage_gb: stats.allocated_storage_gb,
            max_concurrent_labs: stats.max_concurrent_labs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    Unregistered,
    /// Registration submitted, awaiting the licensing service.
    InProgress,
    Registered,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseStatus {
    pub state: LicenseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Lab hypervisor API.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Exchange credentials for a bearer token.
    async fn authenticate(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, ExternalError>;

    async fn check_ready(&self, session: &HypervisorSession) -> Result<bool, ExternalError>;

    async fn get_system_information(
        &self,
        session: &HypervisorSession,
    ) -> Result<SystemInformation, ExternalError>;

    async fn get_system_stats(
        &self,
        session: &HypervisorSession,
    ) -> Result<SystemStats, ExternalError>;

    async fn get_license(&self, session: &HypervisorSession)
        -> Result<LicenseStatus, ExternalError>;

    async fn set_license(
        &self,
        session: &HypervisorSession,
        token: &str,
    ) -> Result<(), ExternalError>;

    async fn remove_license(&self, session: &HypervisorSession) -> Result<(), ExternalError>;

    async fn list_labs(&self, session: &HypervisorSession) -> Result<Vec<LabInfo>, ExternalError>;

    async fn create_lab(
        &self,
        session: &HypervisorSession,
        template: &str,
        title: &str,
    ) -> Result<LabInfo, ExternalError>;

    /// `None` when the lab does not exist.
    async fn get_lab(
        &self,
        session: &HypervisorSession,
        lab_id: &str,
    ) -> Result<Option<LabInfo>, ExternalError>;

    async fn start_lab(&self, session: &HypervisorSession, lab_id: &str)
        -> Result<(), ExternalError>;

    async fn stop_lab(&self, session: &HypervisorSession, lab_id: &str)
        -> Result<(), ExternalError>;

    async fn delete_lab(
        &self,
        session: &HypervisorSession,
        lab_id: &str,
    ) -> Result<(), ExternalError>;

    async fn health_check(&self, session: &HypervisorSession) -> Result<bool, ExternalError>;
}

// =============================================================================
// Token cache
// =============================================================================

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Expiry encoded in a JWT's `exp` claim, if the token carries one.
pub fn token_expires_at(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// A token needs refreshing when it expires within `leeway` of `now`.
/// Tokens without a readable expiry are always refreshed.
pub fn token_needs_refresh(token: &str, now: DateTime<Utc>, leeway: Duration) -> bool {
    let leeway = chrono::Duration::from_std(leeway).unwrap_or(chrono::Duration::zero());
    token_expires_at(token).is_none_or(|exp| exp - leeway <= now)
}

/// Per-URL bearer token cache.
pub struct SessionManager {
    client: Arc<dyn HypervisorClient>,
    clock: Arc<dyn Clock>,
    leeway: Duration,
    tokens: Mutex<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(client: Arc<dyn HypervisorClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            leeway: DEFAULT_TOKEN_LEEWAY,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn client(&self) -> &Arc<dyn HypervisorClient> {
        &self.client
    }

    /// A session for `url`, authenticating if the cached token is missing
    /// or about to expire.
    pub async fn session(
        &self,
        url: &str,
        config: &HypervisorConfig,
    ) -> Result<HypervisorSession, ExternalError> {
        let now = self.clock.now();
        let cached = self
            .lock()
            .get(url)
            .filter(|t| !token_needs_refresh(t, now, self.leeway))
            .cloned();

        let token = match cached {
            Some(token) => token,
            None => {
                debug!(url = %url, "Authenticating to hypervisor");
                let token = self
                    .client
                    .authenticate(url, &config.username, &config.password)
                    .await?;
                self.lock().insert(url.to_string(), token.clone());
                token
            }
        };

        Ok(HypervisorSession {
            url: url.to_string(),
            token,
        })
    }

    /// Session for a worker's hypervisor.
    pub async fn for_worker(&self, worker: &Worker) -> Result<HypervisorSession, ExternalError> {
        let url = worker
            .status
            .hypervisor
            .url
            .clone()
            .or_else(|| worker.hypervisor_url())
            .ok_or_else(|| {
                ExternalError::Hypervisor(format!(
                    "worker {} has no hypervisor address",
                    worker.id()
                ))
            })?;
        self.session(&url, &worker.spec.hypervisor).await
    }

    /// Pass `result` through, dropping the session's token if the
    /// hypervisor rejected it.
    pub fn checked<T>(
        &self,
        session: &HypervisorSession,
        result: Result<T, ExternalError>,
    ) -> Result<T, ExternalError> {
        if let Err(ExternalError::Unauthorized(_)) = &result {
            self.invalidate(&session.url);
        }
        result
    }

    /// Drop the cached token, e.g. after an `Unauthorized` response.
    pub fn invalidate(&self, url: &str) {
        self.lock().remove(url);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Clone)]
struct MockHost {
    ready_checks_remaining: u32,
    license: LicenseState,
    labs: BTreeMap<String, LabInfo>,
    stats: SystemStats,
    healthy: bool,
}

impl MockHost {
    fn new(boot_checks: u32) -> Self {
        Self {
            ready_checks_remaining: boot_checks,
            license: LicenseState::Unregistered,
            labs: BTreeMap::new(),
            stats: MockHypervisor::default_stats(),
            healthy: true,
        }
    }
}

/// Mock hypervisor for testing and development.
///
/// Hosts are created on first authentication. A started lab boots on the
/// next `get_lab`.
pub struct MockHypervisor {
    clock: Arc<dyn Clock>,
    token_ttl: chrono::Duration,
    counter: AtomicU64,
    auth_count: AtomicU64,
    boot_checks: u32,
    hosts: Mutex<HashMap<String, MockHost>>,
    tokens: Mutex<HashSet<String>>,
    reject_licenses: AtomicBool,
    fail_labs: AtomicBool,
    unreachable: AtomicBool,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            token_ttl: chrono::Duration::hours(1),
            counter: AtomicU64::new(0),
            auth_count: AtomicU64::new(0),
            boot_checks: 0,
            hosts: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashSet::new()),
            reject_licenses: AtomicBool::new(false),
            fail_labs: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Number of `check_ready` calls that report not-ready before a new
    /// host comes up.
    pub fn with_boot_checks(mut self, checks: u32) -> Self {
        self.boot_checks = checks;
        self
    }

    pub fn default_stats() -> SystemStats {
        SystemStats {
            total_cpu: 32.0,
            allocated_cpu: 0.0,
            total_memory_mb: 131_072,
            allocated_memory_mb: 0,
            total_storage_gb: 1_000,
            allocated_storage_gb: 0,
            max_concurrent_labs: 20,
        }
    }

    pub fn set_reject_licenses(&self, reject: bool) {
        self.reject_licenses.store(reject, Ordering::SeqCst);
    }

    /// Started labs fail instead of booting.
    pub fn set_fail_labs(&self, fail: bool) {
        self.fail_labs.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, url: &str, healthy: bool) {
        if let Some(host) = self.hosts().get_mut(url) {
            host.healthy = healthy;
        }
    }

    pub fn set_stats(&self, url: &str, stats: SystemStats) {
        if let Some(host) = self.hosts().get_mut(url) {
            host.stats = stats;
        }
    }

    /// Force a lab into `state`, or remove it with `None`.
    pub fn set_lab_state(&self, url: &str, lab_id: &str, state: Option<LabState>) {
        if let Some(host) = self.hosts().get_mut(url) {
            match state {
                Some(state) => {
                    if let Some(lab) = host.labs.get_mut(lab_id) {
                        lab.state = state;
                    }
                }
                None => {
                    host.labs.remove(lab_id);
                }
            }
        }
    }

    pub fn auth_count(&self) -> u64 {
        self.auth_count.load(Ordering::SeqCst)
    }

    pub fn lab_count(&self, url: &str) -> usize {
        self.hosts().get(url).map_or(0, |h| h.labs.len())
    }

    pub fn is_licensed(&self, url: &str) -> bool {
        self.hosts()
            .get(url)
            .is_some_and(|h| h.license == LicenseState::Registered)
    }

    fn hosts(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockHost>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn issue_token(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let exp = (self.clock.now() + self.token_ttl).timestamp();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"mock-{n}","exp":{exp}}}"#));
        format!("{header}.{claims}.")
    }

    /// Check reachability and token, then run `f` against the host.
    fn with_host<T>(
        &self,
        session: &HypervisorSession,
        f: impl FnOnce(&mut MockHost) -> Result<T, ExternalError>,
    ) -> Result<T, ExternalError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ExternalError::Hypervisor(format!(
                "{} is unreachable",
                session.url
            )));
        }
        let known = self
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&session.token);
        if !known {
            return Err(ExternalError::Unauthorized("unknown token".to_string()));
        }
        if token_needs_refresh(&session.token, self.clock.now(), Duration::ZERO) {
            return Err(ExternalError::Unauthorized("token expired".to_string()));
        }
        let mut hosts = self.hosts();
        let host = hosts
            .get_mut(&session.url)
            .ok_or_else(|| ExternalError::Hypervisor(format!("no host at {}", session.url)))?;
        f(host)
    }

    fn lab_not_found(lab_id: &str) -> ExternalError {
        ExternalError::NotFound(format!("lab {lab_id}"))
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for MockHypervisor {
    async fn authenticate(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, ExternalError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ExternalError::Hypervisor(format!("{url} is unreachable")));
        }
        if username.is_empty() || password.is_empty() {
            return Err(ExternalError::Unauthorized("missing credentials".to_string()));
        }
        self.auth_count.fetch_add(1, Ordering::SeqCst);
        self.hosts()
            .entry(url.to_string())
            .or_insert_with(|| MockHost::new(self.boot_checks));

        let token = self.issue_token();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone());
        Ok(token)
    }

    async fn check_ready(&self, session: &HypervisorSession) -> Result<bool, ExternalError> {
        self.with_host(session, |host| {
            if host.ready_checks_remaining == 0 {
                Ok(true)
            } else {
                host.ready_checks_remaining -= 1;
                Ok(false)
            }
        })
    }

    async fn get_system_information(
        &self,
        session: &HypervisorSession,
    ) -> Result<SystemInformation, ExternalError> {
        self.with_host(session, |host| {
            Ok(SystemInformation {
                version: "2.8.1-mock".to_string(),
                ready: host.ready_checks_remaining == 0,
            })
        })
    }

    async fn get_system_stats(
        &self,
        session: &HypervisorSession,
    ) -> Result<SystemStats, ExternalError> {
        self.with_host(session, |host| Ok(host.stats))
    }

    async fn get_license(
        &self,
        session: &HypervisorSession,
    ) -> Result<LicenseStatus, ExternalError> {
        self.with_host(session, |host| {
            Ok(LicenseStatus {
                state: host.license,
                detail: None,
            })
        })
    }

    async fn set_license(
        &self,
        session: &HypervisorSession,
        token: &str,
    ) -> Result<(), ExternalError> {
        let reject = self.reject_licenses.load(Ordering::SeqCst) || token.is_empty();
        self.with_host(session, |host| {
            info!(url = %session.url, "[MOCK] Registering license");
            host.license = if reject {
                LicenseState::Rejected
            } else {
                LicenseState::Registered
            };
            Ok(())
        })
    }

    async fn remove_license(&self, session: &HypervisorSession) -> Result<(), ExternalError> {
        self.with_host(session, |host| {
            info!(url = %session.url, "[MOCK] Deregistering license");
            host.license = LicenseState::Unregistered;
            Ok(())
        })
    }

    async fn list_labs(&self, session: &HypervisorSession) -> Result<Vec<LabInfo>, ExternalError> {
        self.with_host(session, |host| Ok(host.labs.values().cloned().collect()))
    }

    async fn create_lab(
        &self,
        session: &HypervisorSession,
        template: &str,
        title: &str,
    ) -> Result<LabInfo, ExternalError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.with_host(session, |host| {
            let lab = LabInfo {
                id: format!("lab-{n:08x}"),
                title: title.to_string(),
                state: LabState::Defined,
                node_count: 4,
            };
            info!(url = %session.url, lab_id = %lab.id, template = %template, "[MOCK] Creating lab");
            host.labs.insert(lab.id.clone(), lab.clone());
            Ok(lab)
        })
    }

    async fn get_lab(
        &self,
        session: &HypervisorSession,
        lab_id: &str,
    ) -> Result<Option<LabInfo>, ExternalError> {
        let fail = self.fail_labs.load(Ordering::SeqCst);
        self.with_host(session, |host| {
            let Some(lab) = host.labs.get_mut(lab_id) else {
                return Ok(None);
            };
            if lab.state == LabState::Starting {
                lab.state = if fail {
                    LabState::Failed
                } else {
                    LabState::Booted
                };
            }
            Ok(Some(lab.clone()))
        })
    }

    async fn start_lab(
        &self,
        session: &HypervisorSession,
        lab_id: &str,
    ) -> Result<(), ExternalError> {
        self.with_host(session, |host| {
            let lab = host
                .labs
                .get_mut(lab_id)
                .ok_or_else(|| Self::lab_not_found(lab_id))?;
            if matches!(lab.state, LabState::Defined | LabState::Stopped) {
                info!(url = %session.url, lab_id = %lab_id, "[MOCK] Starting lab");
                lab.state = LabState::Starting;
            }
            Ok(())
        })
    }

    async fn stop_lab(
        &self,
        session: &HypervisorSession,
        lab_id: &str,
    ) -> Result<(), ExternalError> {
        self.with_host(session, |host| {
            let lab = host
                .labs
                .get_mut(lab_id)
                .ok_or_else(|| Self::lab_not_found(lab_id))?;
            info!(url = %session.url, lab_id = %lab_id, "[MOCK] Stopping lab");
            lab.state = LabState::Stopped;
            Ok(())
        })
    }

    async fn delete_lab(
        &self,
        session: &HypervisorSession,
        lab_id: &str,
    ) -> Result<(), ExternalError> {
        self.with_host(session, |host| {
            info!(url = %session.url, lab_id = %lab_id, "[MOCK] Deleting lab");
            host.labs
                .remove(lab_id)
                .map(|_| ())
                .ok_or_else(|| Self::lab_not_found(lab_id))
        })
    }

    async fn health_check(&self, session: &HypervisorSession) -> Result<bool, ExternalError> {
        self.with_host(session, |host| Ok(host.healthy))
    }
}
