use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ValidationLevel;

/// Top-level configuration loaded from `~/.auto-wave/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load config from `~/.auto-wave/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_retries == 0 {
            return Err(ConfigError::Validation(
                "agent.max_retries must be at least 1".into(),
            ));
        }
        if self.agent.stuck_threshold < 2 {
            return Err(ConfigError::Validation(
                "agent.stuck_threshold must be at least 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.conflict.confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "conflict.confidence_threshold must be within [0, 1], got {}",
                self.conflict.confidence_threshold
            )));
        }
        if self.orchestrator.max_concurrent_agents == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_concurrent_agents must be at least 1".into(),
            ));
        }
        if self.agent.heartbeat_interval() >= self.orchestrator.staleness_threshold() {
            return Err(ConfigError::Validation(
                "agent.heartbeat_interval must be shorter than orchestrator.staleness_threshold"
                    .into(),
            ));
        }
        self.qa.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        data_dir().join("config.toml")
    }
}

/// `~/.auto-wave`, or `./.auto-wave` when no home directory is known.
fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".auto-wave")
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeneralConfig {
    /// Working tree the agents modify. Defaults to the current directory.
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.auto-wave/state.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
            max_concurrent_agents: default_max_concurrent_agents(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}

fn default_tick_interval_ms() -> u64 {
    250
}
fn default_sweep_interval_ms() -> u64 {
    15_000
}
fn default_staleness_threshold_ms() -> u64 {
    60_000
}
fn default_max_concurrent_agents() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Identical error signatures in a row before a task is escalated to stuck.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Command that turns a task context (JSON on stdin) into a file change.
    #[serde(default)]
    pub executor_command: Option<String>,
    #[serde(default = "default_executor_timeout_secs")]
    pub executor_timeout_secs: u64,
    #[serde(default = "default_validation_command")]
    pub default_validation_command: String,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stuck_threshold: default_stuck_threshold(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            log_tail_lines: default_log_tail_lines(),
            max_transient_retries: default_max_transient_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            executor_command: None,
            executor_timeout_secs: default_executor_timeout_secs(),
            default_validation_command: default_validation_command(),
            validation_timeout_secs: default_validation_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    /// How long a running agent may sit inside one executor or validator
    /// call before its heartbeat is withheld. Both calls are bounded by their
    /// own timeouts, so anything longer is a hang.
    pub fn stall_after(&self) -> Duration {
        self.executor_timeout().max(self.validation_timeout())
            + Duration::from_millis(self.backoff_max_ms)
            + self.heartbeat_interval()
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_stuck_threshold() -> u32 {
    3
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_log_tail_lines() -> usize {
    50
}
fn default_max_transient_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_executor_timeout_secs() -> u64 {
    1800
}
fn default_validation_command() -> String {
    "npm test".into()
}
fn default_validation_timeout_secs() -> u64 {
    600
}

/// What happens to impacts whose confidence is below the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LowConfidencePolicy {
    /// Drop them from conflict computation.
    Ignore,
    /// Any same-path pairing with them conflicts, even READ x READ.
    #[default]
    Conservative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(default)]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub low_confidence: LowConfidencePolicy,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.0,
            low_confidence: LowConfidencePolicy::Conservative,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VcsBackend {
    #[default]
    Git,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    #[serde(default)]
    pub backend: VcsBackend,
    /// Where the snapshot backend keeps its copies.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    /// Top-level names never captured or restored by the snapshot backend.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            backend: VcsBackend::default(),
            snapshot_dir: default_snapshot_dir(),
            exclude: default_exclude(),
        }
    }
}

fn default_snapshot_dir() -> String {
    "~/.auto-wave/snapshots".into()
}
fn default_exclude() -> Vec<String> {
    vec![".git".into(), "node_modules".into()]
}

// ---------------------------------------------------------------------------
// QA levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
}

impl CheckDefinition {
    pub fn new(name: &str, command: &str, required: bool, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required,
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_check_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    pub checks: Vec<CheckDefinition>,
    pub total_budget_secs: u64,
    #[serde(default)]
    pub fail_fast: bool,
}

impl LevelConfig {
    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_budget_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_qa_level")]
    pub default_level: ValidationLevel,
    #[serde(default = "default_max_fix_generations")]
    pub max_fix_generations: u32,
    #[serde(default = "default_levels")]
    /// Keyed by level name (`QUICK`, `STANDARD`, `THOROUGH`, `RELEASE`).
    pub levels: BTreeMap<String, LevelConfig>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_level: default_qa_level(),
            max_fix_generations: default_max_fix_generations(),
            levels: default_levels(),
        }
    }
}

impl QaConfig {
    pub fn level(&self, level: ValidationLevel) -> Option<&LevelConfig> {
        self.levels.get(level.as_str())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.level(self.default_level).is_none() {
            return Err(ConfigError::Validation(format!(
                "qa.default_level {} has no [qa.levels] entry",
                self.default_level
            )));
        }
        for (level, cfg) in &self.levels {
            if cfg.checks.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "qa level {level} has no checks"
                )));
            }
            if cfg.total_budget_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "qa level {level} needs a positive total_budget_secs"
                )));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_qa_level() -> ValidationLevel {
    ValidationLevel::Standard
}
fn default_max_fix_generations() -> u32 {
    2
}

fn default_levels() -> BTreeMap<String, LevelConfig> {
    let tsc = CheckDefinition::new("TypeScript Compilation", "npx tsc --noEmit", true, 120);
    let lint = CheckDefinition::new("Lint", "npm run lint", false, 120);
    let tests = CheckDefinition::new("Tests", "npm test", true, 300);
    let build = CheckDefinition::new("Build", "npm run build", true, 300);
    let coverage = CheckDefinition::new("Coverage", "npm run coverage", false, 300);
    let audit = CheckDefinition::new("Security Audit", "npm audit --audit-level=high", true, 120);

    let mut levels = BTreeMap::new();
    levels.insert(
        ValidationLevel::Quick.as_str().to_string(),
        LevelConfig {
            checks: vec![tsc.clone()],
            total_budget_secs: 120,
            fail_fast: true,
        },
    );
    levels.insert(
        ValidationLevel::Standard.as_str().to_string(),
        LevelConfig {
            checks: vec![tsc.clone(), lint.clone(), tests.clone()],
            total_budget_secs: 600,
            fail_fast: false,
        },
    );
    levels.insert(
        ValidationLevel::Thorough.as_str().to_string(),
        LevelConfig {
            checks: vec![
                tsc.clone(),
                lint.clone(),
                tests.clone(),
                build.clone(),
                coverage.clone(),
            ],
            total_budget_secs: 1200,
            fail_fast: false,
        },
    );
    levels.insert(
        ValidationLevel::Release.as_str().to_string(),
        LevelConfig {
            checks: vec![tsc, lint, tests, build, coverage, audit],
            total_budget_secs: 1800,
            fail_fast: true,
        },
    );
    levels
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
