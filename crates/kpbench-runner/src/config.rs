use crate::adapter::AdapterLimits;
use crate::catalog::{CatalogOptions, ListingOrder};
use crate::watchdog::WatchdogLimits;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on budget plus watchdog margins for one job (one week).
pub const MAX_JOB_SECS: u64 = 7 * 24 * 60 * 60;

/// Batch settings; every field has a default so a config file may be partial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub root: PathBuf,
    pub report: PathBuf,
    pub sizes_per_group: usize,
    pub size_prefix: String,
    pub extension: String,
    pub listing_order: ListingOrder,
    pub time_limit_secs: u64,
    pub solver_margin_secs: u64,
    pub soft_margin_secs: u64,
    pub grace_secs: u64,
    pub kill_grace_secs: u64,
    pub workers: usize,
    pub resume: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("kplib"),
            report: PathBuf::from("results.csv"),
            sizes_per_group: 5,
            size_prefix: "n".to_string(),
            extension: "kp".to_string(),
            listing_order: ListingOrder::default(),
            time_limit_secs: 180,
            solver_margin_secs: 10,
            soft_margin_secs: 5,
            grace_secs: 15,
            kill_grace_secs: 5,
            workers: 1,
            resume: false,
        }
    }
}

impl BatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: BatchConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.time_limit_secs == 0 {
            problems.push("time_limit_secs must be > 0");
        }
        let worst_case = self
            .time_limit_secs
            .checked_add(self.grace_secs)
            .and_then(|s| s.checked_add(self.kill_grace_secs));
        if worst_case.map_or(true, |secs| secs > MAX_JOB_SECS) {
            problems.push("time_limit_secs + grace_secs + kill_grace_secs must not exceed one week");
        }
        if self.solver_margin_secs > MAX_JOB_SECS || self.soft_margin_secs > MAX_JOB_SECS {
            problems.push("solver_margin_secs and soft_margin_secs must not exceed one week");
        }
        if self.workers == 0 {
            problems.push("workers must be > 0");
        }
        if self.sizes_per_group == 0 {
            problems.push("sizes_per_group must be > 0");
        }
        if self.extension.trim().is_empty() {
            problems.push("extension must not be empty");
        }
        if self.extension.starts_with('.') {
            problems.push("extension must not start with '.'");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid config: {}", problems.join("; ")))
        }
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn catalog_options(&self) -> CatalogOptions {
        CatalogOptions {
            sizes_per_group: self.sizes_per_group,
            size_prefix: self.size_prefix.clone(),
            extension: self.extension.clone(),
            order: self.listing_order,
            time_budget: self.time_budget(),
        }
    }

    pub fn adapter_limits(&self) -> AdapterLimits {
        AdapterLimits {
            solver_margin: Duration::from_secs(self.solver_margin_secs),
            soft_margin: Duration::from_secs(self.soft_margin_secs),
        }
    }

    pub fn watchdog_limits(&self) -> WatchdogLimits {
        WatchdogLimits {
            grace_margin: Duration::from_secs(self.grace_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            ..WatchdogLimits::default()
        }
    }
}
