//! Pipeline configuration.
//!
//! Precedence, lowest first: built-in defaults, TOML file, environment
//! (`SKILLGATE_DATA_DIR`, `SKILLGATE_AGGREGATE_URL`,
//! `SKILLGATE_ROLLBACK_FLOOR`, `SKILLGATE_BATCH_INTERVAL_SECS`). The file is
//! `--config`, else `$SKILLGATE_CONFIG`, else `<data_dir>/skillgate.toml`
//! when it exists.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregatorConfig;
use crate::approval::ApprovalPolicy;
use crate::domain::{Result, SkillError, DEFAULT_FIDELITY_THRESHOLD};
use crate::monitor::MonitorConfig;
use crate::retry::RetryPolicy;
use crate::variation::VariationConfig;

pub const CONFIG_ENV: &str = "SKILLGATE_CONFIG";
pub const CONFIG_FILE: &str = "skillgate.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// SurrealDB URL for the aggregate layer; defaults to
    /// `surrealkv://<data_dir>/aggregates`.
    pub aggregate_url: Option<String>,
    pub engine: EngineSection,
    pub registry: RegistrySection,
    pub aggregator: AggregatorSection,
    pub monitor: MonitorSection,
    pub variation: VariationSection,
    pub approvals: ApprovalSection,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".skillgate"),
            aggregate_url: None,
            engine: EngineSection::default(),
            registry: RegistrySection::default(),
            aggregator: AggregatorSection::default(),
            monitor: MonitorSection::default(),
            variation: VariationSection::default(),
            approvals: ApprovalSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub step_timeout_ms: u64,
    /// Worker pool size.
    pub max_concurrency: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub attempt_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 2_000,
            max_retries: 3,
            backoff_base_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSection {
    pub interval_secs: u64,
    pub bucket_secs: i64,
    /// Recent samples kept per version for the rollback window.
    pub recent_capacity: usize,
    /// Records read from the log per round trip.
    pub batch_limit: usize,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            bucket_secs: 3_600,
            recent_capacity: 100,
            batch_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub rollback_floor: f64,
    pub exception_ceiling: f64,
    pub window: usize,
    pub cooldown_secs: u64,
    /// Defaults to the aggregator interval when unset.
    pub poll_interval_secs: Option<u64>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            rollback_floor: 0.85,
            exception_ceiling: 0.05,
            window: 10,
            cooldown_secs: 3_600,
            poll_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariationSection {
    /// Executions each side needs before a trial is decided.
    pub evaluation_window: u64,
    pub candidates_per_round: usize,
    /// Baseline executions required before a marginal skill is varied.
    pub min_baseline_executions: u64,
    /// Defaults to the aggregator interval when unset.
    pub scan_interval_secs: Option<u64>,
}

impl Default for VariationSection {
    fn default() -> Self {
        Self {
            evaluation_window: 100,
            candidates_per_round: 1,
            min_baseline_executions: 100,
            scan_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub required_checks: Vec<String>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            required_checks: ApprovalPolicy::default().required_checks,
        }
    }
}

impl PipelineConfig {
    /// Resolve, parse, override from the process environment and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// `load` with an injectable environment lookup.
    pub fn load_with<F>(explicit: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => env(CONFIG_ENV).map(PathBuf::from).or_else(|| {
                let data_dir = env("SKILLGATE_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PipelineConfig::default().data_dir);
                let candidate = data_dir.join(CONFIG_FILE);
                candidate.exists().then_some(candidate)
            }),
        };

        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(&p).map_err(|e| {
                    SkillError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SkillError::Config(e.to_string()))
    }

    fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env("SKILLGATE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = env("SKILLGATE_AGGREGATE_URL") {
            self.aggregate_url = Some(url);
        }
        if let Some(floor) = env("SKILLGATE_ROLLBACK_FLOOR") {
            self.monitor.rollback_floor = floor.trim().parse().map_err(|_| {
                SkillError::Config(format!("SKILLGATE_ROLLBACK_FLOOR={floor} is not a number"))
            })?;
        }
        if let Some(secs) = env("SKILLGATE_BATCH_INTERVAL_SECS") {
            self.aggregator.interval_secs = secs.trim().parse().map_err(|_| {
                SkillError::Config(format!(
                    "SKILLGATE_BATCH_INTERVAL_SECS={secs} is not an integer"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(SkillError::Config(msg));
        let floor = self.monitor.rollback_floor;
        if !(floor > 0.0 && floor < DEFAULT_FIDELITY_THRESHOLD) {
            return bad(format!(
                "monitor.rollback_floor {floor} must be in (0, {DEFAULT_FIDELITY_THRESHOLD})"
            ));
        }
        let ceiling = self.monitor.exception_ceiling;
        if !(ceiling > 0.0 && ceiling < 1.0) {
            return bad(format!("monitor.exception_ceiling {ceiling} must be in (0, 1)"));
        }
        if self.monitor.window == 0 {
            return bad("monitor.window must be >= 1".into());
        }
        if self.aggregator.recent_capacity < self.monitor.window {
            return bad(format!(
                "aggregator.recent_capacity {} must be >= monitor.window {}",
                self.aggregator.recent_capacity, self.monitor.window
            ));
        }
        if (self.aggregator.recent_capacity as u64) < self.variation.evaluation_window {
            return bad(format!(
                "aggregator.recent_capacity {} must be >= variation.evaluation_window {}",
                self.aggregator.recent_capacity, self.variation.evaluation_window
            ));
        }
        if self.aggregator.interval_secs == 0 || self.aggregator.bucket_secs <= 0 {
            return bad("aggregator interval and bucket width must be positive".into());
        }
        if self.aggregator.batch_limit == 0 {
            return bad("aggregator.batch_limit must be >= 1".into());
        }
        if self.engine.step_timeout_ms == 0 || self.engine.max_concurrency == 0 {
            return bad("engine.step_timeout_ms and engine.max_concurrency must be >= 1".into());
        }
        if self.registry.attempt_timeout_ms == 0 {
            return bad("registry.attempt_timeout_ms must be >= 1".into());
        }
        if self.variation.evaluation_window == 0 || self.variation.candidates_per_round == 0 {
            return bad("variation window and candidates_per_round must be >= 1".into());
        }
        if self.approvals.required_checks.iter().any(|c| c.trim().is_empty()) {
            return bad("approvals.required_checks must not contain blank names".into());
        }
        Ok(())
    }

    pub fn aggregate_url(&self) -> String {
        self.aggregate_url.clone().unwrap_or_else(|| {
            format!("surrealkv://{}", self.data_dir.join("aggregates").display())
        })
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.aggregator.interval_secs)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            interval: self.batch_interval(),
            bucket_secs: self.aggregator.bucket_secs,
            recent_capacity: self.aggregator.recent_capacity,
            batch_limit: self.aggregator.batch_limit,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.step_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(self.registry.attempt_timeout_ms)),
            max_retries: self.registry.max_retries,
            backoff_base: Duration::from_millis(self.registry.backoff_base_ms),
        }
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            required_checks: self.approvals.required_checks.clone(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            rollback_floor: self.monitor.rollback_floor,
            exception_ceiling: self.monitor.exception_ceiling,
            window: self.monitor.window,
            cooldown: Duration::from_secs(self.monitor.cooldown_secs),
            poll_interval: Duration::from_secs(
                self.monitor
                    .poll_interval_secs
                    .unwrap_or(self.aggregator.interval_secs),
            ),
        }
    }

    pub fn variation_config(&self) -> VariationConfig {
        VariationConfig {
            rollback_floor: self.monitor.rollback_floor,
            evaluation_window: self.variation.evaluation_window,
            candidates_per_round: self.variation.candidates_per_round,
            min_baseline_executions: self.variation.min_baseline_executions,
            scan_interval: Duration::from_secs(
                self.variation
                    .scan_interval_secs
                    .unwrap_or(self.aggregator.interval_secs),
            ),
        }
    }
}
