use std::time::Duration;

use anyhow::{Context, Result};

use crate::scheduler::{SchedulerConfig, SchedulingStrategy};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Restrict every loop to one namespace.
    pub namespace: Option<String>,
    pub watch_interval: Duration,
    pub scheduler_interval: Duration,
    pub scheduling_strategy: SchedulingStrategy,
    pub licensing_required: bool,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = var("LABFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let namespace = var("LABFLEET_NAMESPACE").filter(|ns| !ns.trim().is_empty());

        let watch_interval = secs(&var, "LABFLEET_WATCH_INTERVAL_SECS", 5)?;
        let scheduler_interval = secs(&var, "LABFLEET_SCHEDULER_INTERVAL_SECS", 5)?;
        let shutdown_timeout = secs(&var, "LABFLEET_SHUTDOWN_TIMEOUT_SECS", 10)?;

        let scheduling_strategy = match var("LABFLEET_SCHEDULING_STRATEGY") {
            Some(raw) => raw
                .parse::<SchedulingStrategy>()
                .map_err(anyhow::Error::msg)
                .context("LABFLEET_SCHEDULING_STRATEGY")?,
            None => SchedulingStrategy::default(),
        };

        let licensing_required = var("LABFLEET_LICENSING_REQUIRED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        Ok(Self {
            log_level,
            namespace,
            watch_interval,
            scheduler_interval,
            scheduling_strategy,
            licensing_required,
            shutdown_timeout,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            strategy: self.scheduling_strategy,
            licensing_required: self.licensing_required,
            ..SchedulerConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            namespace: None,
            watch_interval: labfleet_reconcile::DEFAULT_WATCH_INTERVAL,
            scheduler_interval: Duration::from_secs(5),
            scheduling_strategy: SchedulingStrategy::default(),
            licensing_required: true,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

fn secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let Some(raw) = var(key) else {
        return Ok(Duration::from_secs(default));
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
    anyhow::ensure!(secs > 0, "{key} must be positive");
    Ok(Duration::from_secs(secs))
}
