//! Shared data types for execution state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by modules and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Status::Pending),
            "RUNNING" => Ok(Status::Running),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            "BLOCKED" => Ok(Status::Blocked),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Persisted state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier (`job_N`).
    pub name: String,
    /// 1-based plan index. Zero means the plan did not record one.
    #[serde(default)]
    pub index: u32,
    pub status: Status,
    /// Raw prerequisite entries as written in the plan.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub loop_count: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, index: u32, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            index,
            status: Status::Pending,
            prerequisites: Vec::new(),
            loop_count: 0,
            retry_count: 0,
            tasks_completed: 0,
            tasks_total: 0,
            failure_reason: None,
            updated_at: now,
        }
    }

    /// Sort key for intra-module order. Jobs without an index sort last.
    pub fn order_key(&self) -> u32 {
        if self.index == 0 { 9999 } else { self.index }
    }
}

/// Persisted state of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub display_name: String,
    pub plan_file: String,
    /// Derived from `jobs`; see [`crate::core::transitions::module_status`].
    pub status: Status,
    /// Module identifiers this module depends on (already expanded).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    pub jobs: Vec<Job>,
}

impl Module {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.name == name)
    }

    /// Look up a job by plan index, falling back to the `job_N` naming scheme.
    pub fn job_by_index(&self, index: u32) -> Option<&Job> {
        let name = format!("job_{index}");
        self.jobs
            .iter()
            .find(|job| job.index == index)
            .or_else(|| self.job(&name))
    }
}

/// Cursor and summary state for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalState {
    pub status: Status,
    pub current_module_index: usize,
    pub current_job_index: usize,
    pub last_update: DateTime<Utc>,
}

/// Durable record of every module and job. Loaded and saved as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub modules: Vec<Module>,
    pub global: GlobalState,
}

impl ExecutionStatus {
    pub fn new(modules: Vec<Module>, now: DateTime<Utc>) -> Self {
        Self {
            modules,
            global: GlobalState {
                status: Status::Pending,
                current_module_index: 0,
                current_job_index: 0,
                last_update: now,
            },
        }
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.name == name)
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.modules.iter_mut().find(|module| module.name == name)
    }

    pub fn job(&self, module: &str, job: &str) -> Option<&Job> {
        self.module(module).and_then(|m| m.job(job))
    }

    pub fn job_mut(&mut self, module: &str, job: &str) -> Option<&mut Job> {
        self.module_mut(module).and_then(|m| m.job_mut(job))
    }

    /// Positions of a module and job within the ordered lists.
    pub fn position(&self, module: &str, job: &str) -> Option<(usize, usize)> {
        let module_idx = self.modules.iter().position(|m| m.name == module)?;
        let job_idx = self.modules[module_idx]
            .jobs
            .iter()
            .position(|j| j.name == job)?;
        Some((module_idx, job_idx))
    }

    /// Count jobs per status, in `Status` declaration order.
    pub fn job_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.modules.iter().flat_map(|m| m.jobs.iter()) {
            counts.add(job.status);
        }
        counts
    }
}

/// Per-status job tally used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    fn add(&mut self, status: Status) {
        match status {
            Status::Pending => self.pending += 1,
            Status::Running => self.running += 1,
            Status::Completed => self.completed += 1,
            Status::Failed => self.failed += 1,
            Status::Blocked => self.blocked += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.blocked
    }
}
