use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono_tz::Tz;
use cron::Schedule;
use serde::Deserialize;

use crate::engine::context::TimingPolicy;
use crate::rules::TaskRegistry;

pub const DEFAULT_CONFIG_FILE: &str = "caseflow.yaml";
pub const DEFAULT_TIMEZONE: &str = "Europe/London";
pub const DEFAULT_CASE_TYPE: &str = "NFD";

/// Configuration loaded from `caseflow.yaml`.
/// All fields are optional; missing fields fall back to env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CaseflowConfig {
    pub store: StoreConfig,
    /// IANA time zone that case dates are interpreted in.
    pub timezone: Option<String>,
    pub max_concurrent_submissions: Option<usize>,
    pub timing: TimingPolicy,
    /// Task name → schedule.
    pub tasks: BTreeMap<String, TaskConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub base_url: Option<String>,
    pub case_type: Option<String>,
    pub page_size: Option<usize>,
    pub timeout_s: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TaskConfig {
    /// 6-field cron expression, e.g. `0 0 9 * * *`.
    pub schedule: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CaseflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `caseflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: CaseflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    pub fn timezone(&self) -> Result<Tz> {
        let name = self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE);
        Tz::from_str(name).map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", name, e))
    }

    /// Store URL from config, falling back to `CASEFLOW_STORE_URL`.
    pub fn store_url(&self) -> Option<String> {
        self.store
            .base_url
            .clone()
            .or_else(|| std::env::var("CASEFLOW_STORE_URL").ok())
    }

    pub fn case_type(&self) -> &str {
        self.store.case_type.as_deref().unwrap_or(DEFAULT_CASE_TYPE)
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size.unwrap_or(crate::engine::runner::DEFAULT_PAGE_SIZE)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.store.timeout_s.unwrap_or(30.0).max(0.0))
    }

    /// Names of enabled tasks with their schedules.
    pub fn enabled_tasks(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.enabled)
            .map(|(name, t)| (name.as_str(), t.schedule.as_str()))
    }

    /// Every problem with the configuration, not just the first.
    pub fn validate(&self, registry: &TaskRegistry) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.timezone() {
            errors.push(e.to_string());
        }
        if self.store.page_size == Some(0) {
            errors.push("store.page_size must be at least 1".to_string());
        }
        if self.max_concurrent_submissions == Some(0) {
            errors.push("max_concurrent_submissions must be at least 1".to_string());
        }

        for (name, task) in &self.tasks {
            if registry.get(name).is_none() {
                errors.push(format!("Unknown task '{}'", name));
            }
            if let Err(e) = Schedule::from_str(&task.schedule) {
                errors.push(format!("Task '{}' has invalid schedule '{}': {}", name, task.schedule, e));
            }
        }

        errors
    }
}
