//! Configuration for the Foreman orchestrator.
//!
//! Settings are layered: `.foreman/foreman.toml` → environment → CLI flags.
//! The resolved [`Config`] carries every runtime knob and the filesystem
//! layout rooted at `.foreman/` inside the orchestrated project.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workers]
//! count = 3
//! max_iterations_per_feature = 10
//! heartbeat_interval_seconds = 60
//! stale_claim_threshold_seconds = 600
//! max_ci_attempts = 3
//!
//! [budget]
//! max_daily_cost = 50.0
//! cost_per_input_token = 0.000003
//! cost_per_output_token = 0.000015
//! cooldown_seconds = 300
//!
//! [builder]
//! cmd = "claude"
//! args = ["--print", "--dangerously-skip-permissions"]
//!
//! [vcs]
//! default_branch = "main"
//! feature_branch_prefix = "feature"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `[workers]` section of `foreman.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersToml {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_feature: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_stale_threshold")]
    pub stale_claim_threshold_seconds: u64,
    #[serde(default = "default_max_ci_attempts")]
    pub max_ci_attempts: u32,
}

fn default_worker_count() -> usize {
    3
}
fn default_max_iterations() -> u32 {
    10
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_stale_threshold() -> u64 {
    600
}
fn default_max_ci_attempts() -> u32 {
    3
}

impl Default for WorkersToml {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            max_iterations_per_feature: default_max_iterations(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            stale_claim_threshold_seconds: default_stale_threshold(),
            max_ci_attempts: default_max_ci_attempts(),
        }
    }
}

/// `[budget]` section of `foreman.toml`.
///
/// Per-token prices and the daily cap are configuration, never baked-in
/// provider constants. A cap of `0.0` disables the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetToml {
    #[serde(default)]
    pub max_daily_cost: f64,
    #[serde(default)]
    pub cost_per_input_token: f64,
    #[serde(default)]
    pub cost_per_output_token: f64,
    #[serde(default = "default_budget_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_budget_cooldown() -> u64 {
    300
}

impl Default for BudgetToml {
    fn default() -> Self {
        Self {
            max_daily_cost: 0.0,
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
            cooldown_seconds: default_budget_cooldown(),
        }
    }
}

/// `[builder]` section of `foreman.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderToml {
    #[serde(default = "default_builder_cmd")]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_builder_cmd() -> String {
    "claude".to_string()
}

impl Default for BuilderToml {
    fn default() -> Self {
        Self {
            cmd: default_builder_cmd(),
            args: Vec::new(),
        }
    }
}

/// `[vcs]` section of `foreman.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsToml {
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub feature_branch_prefix: String,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_branch_prefix() -> String {
    "feature".to_string()
}

impl Default for VcsToml {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            feature_branch_prefix: default_branch_prefix(),
        }
    }
}

/// Root of the `foreman.toml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub workers: WorkersToml,
    #[serde(default)]
    pub budget: BudgetToml,
    #[serde(default)]
    pub builder: BuilderToml,
    #[serde(default)]
    pub vcs: VcsToml,
}

impl ForemanToml {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Resolved runtime configuration.
///
/// All persistent artifacts live under `<project_dir>/.foreman/`. The state
/// document must never be committed to source control; the catalog is.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub state_path: PathBuf,
    pub ledger_path: PathBuf,
    pub decisions_path: PathBuf,
    pub locks_path: PathBuf,
    pub heartbeats_path: PathBuf,
    pub log_dir: PathBuf,
    pub merge_plan_path: PathBuf,

    pub num_workers: usize,
    pub max_iterations_per_feature: u32,
    pub max_ci_attempts: u32,
    pub stale_claim_threshold: Duration,
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    pub supervision_interval: Duration,
    pub budget_cooldown: Duration,
    pub decision_timeout: Duration,
    /// Mutex wait for claim-path mutations.
    pub claim_lock_timeout: Duration,
    /// Mutex wait for everything else.
    pub lock_timeout: Duration,

    pub max_daily_cost: f64,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,

    pub builder_cmd: String,
    pub builder_args: Vec<String>,
    pub default_branch: String,
    pub feature_branch_prefix: String,

    pub verbose: bool,
}

impl Config {
    /// Resolve configuration for a project directory, layering the TOML file
    /// under `.foreman/foreman.toml` with environment overrides.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foreman_dir = project_dir.join(".foreman");
        let file = ForemanToml::load(&foreman_dir.join("foreman.toml"))?;

        let num_workers = std::env::var("FOREMAN_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(file.workers.count);
        let builder_cmd =
            std::env::var("FOREMAN_BUILDER_CMD").unwrap_or_else(|_| file.builder.cmd.clone());

        Ok(Self {
            catalog_path: foreman_dir.join("features.json"),
            state_path: foreman_dir.join("state.json"),
            ledger_path: foreman_dir.join("costs.csv"),
            decisions_path: foreman_dir.join("decisions"),
            locks_path: foreman_dir.join("locks"),
            heartbeats_path: foreman_dir.join("heartbeats"),
            log_dir: foreman_dir.join("logs"),
            merge_plan_path: foreman_dir.join("merge-plan.md"),
            project_dir,

            num_workers,
            max_iterations_per_feature: file.workers.max_iterations_per_feature,
            max_ci_attempts: file.workers.max_ci_attempts,
            stale_claim_threshold: Duration::from_secs(
                file.workers.stale_claim_threshold_seconds,
            ),
            heartbeat_interval: Duration::from_secs(file.workers.heartbeat_interval_seconds),
            reaper_interval: Duration::from_secs(60),
            supervision_interval: Duration::from_secs(30),
            budget_cooldown: Duration::from_secs(file.budget.cooldown_seconds),
            decision_timeout: Duration::from_secs(3600),
            claim_lock_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(30),

            max_daily_cost: file.budget.max_daily_cost,
            cost_per_input_token: file.budget.cost_per_input_token,
            cost_per_output_token: file.budget.cost_per_output_token,

            builder_cmd,
            builder_args: file.builder.args,
            default_branch: file.vcs.default_branch,
            feature_branch_prefix: file.vcs.feature_branch_prefix,

            verbose,
        })
    }

    /// Create the runtime directories under `.foreman/`.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.decisions_path)
            .context("Failed to create decisions directory")?;
        std::fs::create_dir_all(&self.locks_path).context("Failed to create locks directory")?;
        std::fs::create_dir_all(&self.heartbeats_path)
            .context("Failed to create heartbeats directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}
