//! Test-only builders, doubles, and a throwaway git repository.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::core::transitions::module_status;
use crate::core::types::{ExecutionStatus, Job, Module, Status};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::cancel::Cancellation;
use crate::io::process::{ProcessError, ProcessResult};
use crate::io::state_store::StateStore;

/// Fixed timestamp so fixtures compare equal.
pub fn fixed_now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A job with deterministic defaults.
pub fn job(name: &str, index: u32, status: Status) -> Job {
    Job {
        status,
        tasks_total: 1,
        ..Job::new(name, index, fixed_now())
    }
}

pub fn job_with_prereqs(name: &str, index: u32, status: Status, prereqs: &[&str]) -> Job {
    Job {
        prerequisites: prereqs.iter().map(|p| p.to_string()).collect(),
        ..job(name, index, status)
    }
}

/// A module whose status is derived from `jobs`.
pub fn module(name: &str, jobs: Vec<Job>) -> Module {
    module_with_deps(name, &[], jobs)
}

pub fn module_with_deps(name: &str, deps: &[&str], jobs: Vec<Job>) -> Module {
    Module {
        name: name.to_string(),
        display_name: name.to_string(),
        plan_file: format!("{name}.md"),
        status: module_status(&jobs),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        jobs,
    }
}

pub fn state_of(modules: Vec<Module>) -> ExecutionStatus {
    ExecutionStatus::new(modules, fixed_now())
}

/// Write `<dir>/<name>.md` with one task per job. `jobs` pairs a job index with
/// an inline prerequisite list (empty for none).
pub fn write_plan(dir: &Path, name: &str, deps: &[&str], jobs: &[(u32, &str)]) {
    let mut out = format!("# Plan: {name}\n\n");
    let deps = if deps.is_empty() {
        "none".to_string()
    } else {
        deps.join(", ")
    };
    let _ = writeln!(out, "**Dependencies**: {deps}\n");
    for (index, prereqs) in jobs {
        let _ = writeln!(out, "### Job {index}: {name} job {index}\n");
        if !prereqs.is_empty() {
            let _ = writeln!(out, "**Prerequisites**: {prereqs}\n");
        }
        let _ = writeln!(out, "- [ ] Task 1: implement {name} job {index}\n");
    }
    fs::create_dir_all(dir).expect("create plan dir");
    fs::write(dir.join(format!("{name}.md")), out).expect("write plan");
}

/// In-memory [`StateStore`] that counts saves.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    state: ExecutionStatus,
    saved: Option<ExecutionStatus>,
    saves: usize,
}

impl MemoryStateStore {
    pub fn new(state: ExecutionStatus) -> Self {
        Self {
            state,
            saved: None,
            saves: 0,
        }
    }

    pub fn saves(&self) -> usize {
        self.saves
    }

    /// The last saved snapshot.
    pub fn saved(&self) -> Option<&ExecutionStatus> {
        self.saved.as_ref()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&mut self) -> Result<()> {
        if let Some(saved) = &self.saved {
            self.state = saved.clone();
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        self.state.global.last_update = Utc::now();
        self.saved = Some(self.state.clone());
        self.saves += 1;
        Ok(())
    }

    fn state(&self) -> &ExecutionStatus {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecutionStatus {
        &mut self.state
    }
}

/// A finished-process record with the given exit code.
pub fn process_result(exit_code: i32) -> ProcessResult {
    ProcessResult {
        exit_code,
        stdout: Some(String::new()),
        stderr: Some(if exit_code == 0 {
            String::new()
        } else {
            format!("agent exited with {exit_code}")
        }),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration: Duration::from_millis(5),
        timed_out: false,
        interrupted: false,
        signal: None,
    }
}

type Hook = Box<dyn Fn(&AgentRequest, &Cancellation) + Send + Sync>;

/// [`AgentRunner`] that replays queued outcomes and records requests.
///
/// When the queue is empty every run succeeds. With `touch_files` each run
/// writes `<module>_<job>.txt` into the request workdir so checkpoints have
/// something to commit.
#[derive(Default)]
pub struct ScriptedAgent {
    outcomes: Mutex<VecDeque<Result<ProcessResult, ProcessError>>>,
    requests: Mutex<Vec<AgentRequest>>,
    touch_files: bool,
    hook: Option<Hook>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touching_files(mut self) -> Self {
        self.touch_files = true;
        self
    }

    /// Run `hook` at the start of every invocation.
    pub fn with_hook(mut self, hook: impl Fn(&AgentRequest, &Cancellation) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn then(self, outcome: Result<ProcessResult, ProcessError>) -> Self {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push_back(outcome);
        self
    }

    pub fn then_succeed(self) -> Self {
        self.then(Ok(process_result(0)))
    }

    pub fn then_exit(self, exit_code: i32) -> Self {
        self.then(Ok(process_result(exit_code)))
    }

    pub fn then_time_out(self) -> Self {
        let mut result = process_result(143);
        result.timed_out = true;
        result.interrupted = true;
        self.then(Err(ProcessError::TimedOut(result)))
    }

    /// `(module, job)` of every request so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|r| (r.module.clone(), r.job.clone()))
            .collect()
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(
        &self,
        request: &AgentRequest,
        cancel: &Cancellation,
    ) -> Result<ProcessResult, ProcessError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(hook) = &self.hook {
            hook(request, cancel);
        }
        if self.touch_files {
            let path = request
                .workdir
                .join(format!("{}_{}.txt", request.module, request.job));
            fs::write(&path, format!("{}\n", request.prompt.len())).expect("touch file");
        }
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or_else(|| Ok(process_result(0)))
    }
}

/// A temporary git repository with one initial commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "morty@example.com"])?;
        repo.git(&["config", "user.name", "Morty Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join("README.md"), "# test repo\n").context("write README")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {args:?}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.parse().with_context(|| format!("parse commit count '{out}'"))
    }

    pub fn head_subject(&self) -> Result<String> {
        self.git(&["log", "-1", "--pretty=format:%s"])
    }

    pub fn head_hash(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn branches(&self) -> Result<Vec<String>> {
        let out = self.git(&["branch", "--format=%(refname:short)"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn commit_file(&self, name: &str, contents: &str, message: &str) -> Result<()> {
        fs::write(self.path().join(name), contents).with_context(|| format!("write {name}"))?;
        self.git(&["add", name])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Write a plan under `.morty/plan`.
    pub fn write_plan(&self, name: &str, deps: &[&str], jobs: &[(u32, &str)]) {
        write_plan(&self.path().join(".morty/plan"), name, deps, jobs);
    }
}
