//! Agent invocation.
//!
//! [`AgentRunner`] decouples step execution from the agent backend. The
//! default [`CliAgent`] runs the configured CLI through [`ProcessExecutor`]
//! with the prompt on stdin. Tests use scripted runners that return queued
//! results without spawning processes.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::cancel::Cancellation;
use crate::io::config::AgentConfig;
use crate::io::process::{OutputMode, ProcessError, ProcessExecutor, ProcessResult, ProcessSpec};

/// One agent run for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub module: String,
    pub job: String,
    pub prompt: String,
    pub workdir: PathBuf,
    /// Where to write the captured output, if anywhere.
    pub log_path: Option<PathBuf>,
}

pub trait AgentRunner {
    /// Run the agent to completion. A natural non-zero exit is `Ok`.
    fn run(
        &self,
        request: &AgentRequest,
        cancel: &Cancellation,
    ) -> Result<ProcessResult, ProcessError>;
}

/// Runs the configured agent CLI.
#[derive(Debug, Clone)]
pub struct CliAgent {
    executor: ProcessExecutor,
    config: AgentConfig,
}

impl CliAgent {
    pub fn new(executor: ProcessExecutor, config: AgentConfig) -> Self {
        Self { executor, config }
    }

    /// The process descriptor for `request`.
    pub fn spec(&self, request: &AgentRequest) -> ProcessSpec {
        let output = if self.config.stream_output {
            OutputMode::Stream
        } else {
            OutputMode::Capture {
                limit_bytes: self.config.output_limit_bytes,
            }
        };
        ProcessSpec::new(self.config.resolved_command())
            .args(self.config.build_args())
            .workdir(&request.workdir)
            .env("MORTY_MODULE", &request.module)
            .env("MORTY_JOB", &request.job)
            .stdin(request.prompt.clone())
            .timeout(self.config.timeout())
            .grace_period(self.config.grace_period())
            .output(output)
    }
}

impl AgentRunner for CliAgent {
    #[instrument(skip_all, fields(module = %request.module, job = %request.job, timeout_secs = self.config.timeout_secs))]
    fn run(
        &self,
        request: &AgentRequest,
        cancel: &Cancellation,
    ) -> Result<ProcessResult, ProcessError> {
        let spec = self.spec(request);
        info!(program = %spec.program, "starting agent");
        let outcome = self.executor.run(spec, cancel);

        if let Some(path) = &request.log_path {
            let result = match &outcome {
                Ok(result) => Some(result),
                Err(err) => err.result(),
            };
            if let Some(result) = result
                && let Err(err) = write_agent_log(path, result)
            {
                warn!(err = %format!("{err:#}"), "failed to write agent log");
            }
        }
        outcome
    }
}

/// Inputs for a job prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    /// Contents of the configured prompt file.
    pub preamble: Option<&'a str>,
    pub module: &'a str,
    pub module_display_name: &'a str,
    pub job: &'a str,
    pub job_title: &'a str,
    /// Job section from the plan file.
    pub job_body: &'a str,
    /// One line per prerequisite, already resolved.
    pub prerequisites: &'a [String],
    pub loop_number: u32,
}

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    if let Some(preamble) = ctx.preamble.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str(preamble);
        out.push_str("\n\n---\n\n");
    }
    let _ = writeln!(out, "# Module: {} ({})", ctx.module_display_name, ctx.module);
    if ctx.job_title.is_empty() {
        let _ = writeln!(out, "## Job: {}", ctx.job);
    } else {
        let _ = writeln!(out, "## Job: {} - {}", ctx.job, ctx.job_title);
    }
    let _ = writeln!(out, "\nLoop: {}", ctx.loop_number);
    if !ctx.job_body.trim().is_empty() {
        out.push('\n');
        out.push_str(ctx.job_body.trim());
        out.push('\n');
    }
    if !ctx.prerequisites.is_empty() {
        out.push_str("\n## Prerequisites\n");
        for line in ctx.prerequisites {
            let _ = writeln!(out, "- {line}");
        }
    }
    out
}

fn write_agent_log(path: &Path, result: &ProcessResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    let _ = writeln!(
        buf,
        "exit_code: {}\nduration_ms: {}\ntimed_out: {}\ninterrupted: {}",
        result.exit_code,
        result.duration.as_millis(),
        result.timed_out,
        result.interrupted
    );
    buf.push_str("=== stdout ===\n");
    buf.push_str(result.stdout.as_deref().unwrap_or("[streamed]"));
    if result.stdout_truncated > 0 {
        let _ = write!(buf, "\n[stdout truncated {} bytes]", result.stdout_truncated);
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(result.stderr.as_deref().unwrap_or("[streamed]"));
    if result.stderr_truncated > 0 {
        let _ = write!(buf, "\n[stderr truncated {} bytes]", result.stderr_truncated);
    }
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}
