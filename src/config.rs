//! Runner configuration.
//!
//! # Sources, in precedence order
//! 1. `LLM_RUNNER_*` environment overrides
//! 2. A YAML config file (explicit path, `LLM_RUNNER_CONFIG`, or
//!    `./llm-runner.yaml` when present)
//! 3. Compiled-in defaults
//!
//! The orchestration tunables (concurrency bound, re-decomposition
//! bound, task deadline) live here rather than as constants; tests pin
//! them explicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

fn default_transcripts_dir() -> PathBuf {
    PathBuf::from(".llm").join("transcripts")
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_max_redecompositions() -> u32 {
    1
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_tier_name() -> String {
    "pro".to_string()
}

fn default_flat_cost_cents() -> u64 {
    5
}

/// Configuration for one model tier.
///
/// A tier with a `command` spawns that process as its worker; the command
/// must speak the runner's line-event protocol (see `worker::process`).
/// A tier without a command uses the built-in deterministic worker, which
/// is what tests and offline runs rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Provider model identifier handed to the worker (e.g.
    /// `anthropic/claude-sonnet-4.5`).
    pub model: String,
    /// Worker command line; `None` selects the deterministic worker.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Tier used for delegated sub-agent work. Defaults to this tier.
    #[serde(default)]
    pub subagent: Option<String>,
    /// Charge applied when the worker reports no cost of its own.
    #[serde(default = "default_flat_cost_cents")]
    pub flat_cost_cents: u64,
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Directory holding one transcript file per session identity.
    #[serde(default = "default_transcripts_dir")]
    pub transcripts_dir: PathBuf,

    /// Directory the per-session output roots are created under.
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,

    /// Maximum tasks executing simultaneously. Excess specs queue FIFO.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// How many fresh decompositions the controller may request after a
    /// task failure before the directive is unsatisfiable.
    #[serde(default = "default_max_redecompositions")]
    pub max_redecompositions: u32,

    /// Per-task deadline. Expiry is classified like a worker error.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Tier assumed when a request names none.
    #[serde(default = "default_tier_name")]
    pub default_tier: String,

    /// Static tier table consulted by the model router.
    #[serde(default = "RunnerConfig::default_tiers")]
    pub tiers: HashMap<String, TierConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            transcripts_dir: default_transcripts_dir(),
            outputs_dir: default_outputs_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_redecompositions: default_max_redecompositions(),
            task_timeout_secs: default_task_timeout_secs(),
            default_tier: default_tier_name(),
            tiers: Self::default_tiers(),
        }
    }
}

impl RunnerConfig {
    /// Built-in tier table: the `pro` tier the invocation scripts name,
    /// delegating sub-agent work to a cheaper `fast` tier.
    fn default_tiers() -> HashMap<String, TierConfig> {
        let mut tiers = HashMap::new();
        tiers.insert(
            "pro".to_string(),
            TierConfig {
                model: "anthropic/claude-sonnet-4.5".to_string(),
                command: None,
                subagent: Some("fast".to_string()),
                flat_cost_cents: default_flat_cost_cents(),
            },
        );
        tiers.insert(
            "fast".to_string(),
            TierConfig {
                model: "anthropic/claude-3.5-haiku".to_string(),
                command: None,
                subagent: None,
                flat_cost_cents: 2,
            },
        );
        tiers
    }

    /// Load configuration, then apply environment overrides.
    ///
    /// An explicit `path` must exist; the `LLM_RUNNER_CONFIG` and
    /// `./llm-runner.yaml` fallbacks are only used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(path) {
            Some(file) => {
                let contents = std::fs::read_to_string(&file).map_err(|e| {
                    RunnerError::config(format!("cannot read {}: {}", file.display(), e))
                })?;
                serde_yaml::from_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(p.to_path_buf());
        }
        if let Ok(p) = std::env::var("LLM_RUNNER_CONFIG") {
            if !p.trim().is_empty() {
                return Some(PathBuf::from(p));
            }
        }
        let local = PathBuf::from("llm-runner.yaml");
        if local.is_file() {
            return Some(local);
        }
        None
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_var_string("LLM_RUNNER_TRANSCRIPTS_DIR") {
            self.transcripts_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_var_string("LLM_RUNNER_OUTPUTS_DIR") {
            self.outputs_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_var_parsed::<usize>("LLM_RUNNER_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = n;
        }
        if let Some(n) = env_var_parsed::<u32>("LLM_RUNNER_MAX_REDECOMPOSITIONS") {
            self.max_redecompositions = n;
        }
        if let Some(n) = env_var_parsed::<u64>("LLM_RUNNER_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = n;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(RunnerError::config(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if self.task_timeout_secs == 0 {
            return Err(RunnerError::config("task_timeout_secs must be at least 1"));
        }
        if self.tiers.is_empty() {
            return Err(RunnerError::config("at least one tier must be configured"));
        }
        for (name, tier) in &self.tiers {
            if let Some(sub) = &tier.subagent {
                if !self.tiers.contains_key(sub) {
                    return Err(RunnerError::config(format!(
                        "tier '{}' delegates to unknown tier '{}'",
                        name, sub
                    )));
                }
            }
            if let Some(cmd) = &tier.command {
                if cmd.is_empty() {
                    return Err(RunnerError::config(format!(
                        "tier '{}' has an empty worker command",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn env_var_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_var_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var_string(name).and_then(|v| v.trim().parse().ok())
}
