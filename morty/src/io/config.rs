//! Morty configuration stored under `.morty/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Morty configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MortyConfig {
    pub agent: AgentConfig,
    pub execution: ExecutionConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

/// How to invoke the external coding agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable. Overridden by the environment variable named in `env_var`.
    pub command: String,
    pub env_var: String,
    /// Extra arguments passed before the generated ones.
    pub args: Vec<String>,
    /// Append `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
    /// Value for `--output-format`; empty disables the flag.
    pub output_format: String,
    pub timeout_secs: u64,
    /// Time between the graceful termination signal and a forced kill.
    pub grace_period_secs: u64,
    /// Bytes of stdout/stderr kept per stream when capturing.
    pub output_limit_bytes: usize,
    /// Inherit the terminal instead of capturing output.
    pub stream_output: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            env_var: "CLAUDE_CODE_CLI".to_string(),
            args: vec!["--verbose".to_string()],
            skip_permissions: true,
            output_format: "json".to_string(),
            timeout_secs: 30 * 60,
            grace_period_secs: 10,
            output_limit_bytes: 1_000_000,
            stream_output: false,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Resolve the executable, honouring the environment override.
    pub fn resolved_command(&self) -> String {
        if !self.env_var.is_empty()
            && let Ok(value) = std::env::var(&self.env_var)
            && !value.trim().is_empty()
        {
            return value;
        }
        self.command.clone()
    }

    /// Arguments for one invocation. The prompt itself goes to stdin.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if !self.output_format.is_empty() {
            args.push("--output-format".to_string());
            args.push(self.output_format.clone());
        }
        args.push("-p".to_string());
        args
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// A FAILED job may be retried this many times before it is refused.
    pub max_retries: u32,
    /// Commit a checkpoint after every successful job.
    pub auto_commit: bool,
    /// Keep going with other jobs after a failure in continuous mode.
    pub continue_on_error: bool,
    /// Reserved. Jobs always run one at a time.
    pub parallel_jobs: u32,
    /// Treat prerequisites that reference missing jobs as unmet.
    pub strict_prerequisites: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            auto_commit: true,
            continue_on_error: false,
            parallel_jobs: 1,
            strict_prerequisites: false,
        }
    }
}

/// Paths relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub plan_dir: PathBuf,
    pub status_file: PathBuf,
    /// Optional preamble prepended to every job prompt.
    pub prompt_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            plan_dir: PathBuf::from(".morty/plan"),
            status_file: PathBuf::from(".morty/status.json"),
            prompt_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` and `MORTY_LOG` are unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl MortyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.execution.parallel_jobs == 0 {
            return Err(anyhow!("execution.parallel_jobs must be >= 1"));
        }
        if self.paths.plan_dir.as_os_str().is_empty() {
            return Err(anyhow!("paths.plan_dir must be non-empty"));
        }
        if self.paths.status_file.as_os_str().is_empty() {
            return Err(anyhow!("paths.status_file must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MortyConfig::default()`.
pub fn load_config(path: &Path) -> Result<MortyConfig> {
    if !path.exists() {
        let cfg = MortyConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MortyConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MortyConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
