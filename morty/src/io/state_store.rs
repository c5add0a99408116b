//! Durable execution state: generation from plans and JSON persistence.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::graph::DependencyGraph;
use crate::core::selector::{JobSelector, SelectOutcome, SelectedJob, Target};
use crate::core::transitions::{apply_job_status, module_status};
use crate::core::types::{ExecutionStatus, Job, Module, Status};
use crate::io::plan::load_plan_dir;
use crate::io::write_atomic;

/// Build a fresh state from the plan directory, modules in dependency order.
#[instrument(skip_all, fields(plan_dir = %plan_dir.display()))]
pub fn generate_status(plan_dir: &Path) -> Result<ExecutionStatus> {
    let plans = load_plan_dir(plan_dir)?;
    if plans.is_empty() {
        bail!("no plan files found in {}", plan_dir.display());
    }

    let graph = DependencyGraph::new(
        plans
            .iter()
            .map(|plan| (plan.name.as_str(), plan.dependencies.as_slice())),
    );
    for (module, missing) in graph.unknown_dependencies() {
        warn!(module = %module, dependency = %missing, "dependency names no known module, ignored");
    }
    let order = graph
        .topological_order()
        .context("order modules by dependency")?;

    let now = Utc::now();
    let mut modules = Vec::with_capacity(order.len());
    for name in &order {
        let Some(plan) = plans.iter().find(|plan| &plan.name == name) else {
            continue;
        };
        let jobs: Vec<Job> = plan
            .jobs
            .iter()
            .map(|planned| Job {
                prerequisites: planned.prerequisites.clone(),
                tasks_total: planned.tasks_total,
                ..Job::new(planned.name.clone(), planned.index, now)
            })
            .collect();
        modules.push(Module {
            name: plan.name.clone(),
            display_name: plan.display_name.clone(),
            plan_file: plan.plan_file.clone(),
            status: module_status(&jobs),
            dependencies: graph
                .dependencies(name)
                .map(|deps| deps.iter().cloned().collect())
                .unwrap_or_default(),
            jobs,
        });
    }
    info!(modules = modules.len(), "generated execution state");
    Ok(ExecutionStatus::new(modules, now))
}

/// Access to the persisted execution state.
pub trait StateStore {
    /// Re-read state from the backing store.
    fn load(&mut self) -> Result<()>;
    /// Persist the current state, stamping `global.last_update`.
    fn save(&mut self) -> Result<()>;
    fn state(&self) -> &ExecutionStatus;
    fn state_mut(&mut self) -> &mut ExecutionStatus;

    fn job(&self, module: &str, job: &str) -> Option<&Job> {
        self.state().job(module, job)
    }

    /// Validated status change, saved immediately.
    fn update_job_status(&mut self, module: &str, job: &str, status: Status) -> Result<()> {
        apply_job_status(self.state_mut(), module, job, status, Utc::now())?;
        self.save()
    }

    /// The job auto-selection would run next, if any.
    fn next_pending_job(&self) -> Result<Option<SelectedJob>> {
        match JobSelector::new(self.state()).select(&Target::Auto)? {
            SelectOutcome::Selected(selected) => Ok(Some(selected)),
            SelectOutcome::NoExecutableJob { .. } => Ok(None),
        }
    }

    /// Replace the state with one generated from `plan_dir` and save it.
    fn initialize(&mut self, plan_dir: &Path) -> Result<()> {
        *self.state_mut() = generate_status(plan_dir)?;
        self.save()
    }
}

/// State kept in a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    state: ExecutionStatus,
}

impl FileStateStore {
    /// Wrap an in-memory state. Nothing is written until [`StateStore::save`].
    pub fn new(path: impl Into<PathBuf>, state: ExecutionStatus) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }

    /// Load an existing status file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = read_status(&path)?;
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&mut self) -> Result<()> {
        self.state = read_status(&self.path)?;
        Ok(())
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn save(&mut self) -> Result<()> {
        self.state.global.last_update = Utc::now();
        let mut buf = serde_json::to_string_pretty(&self.state).context("serialize state")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)?;
        debug!("state saved");
        Ok(())
    }

    fn state(&self) -> &ExecutionStatus {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecutionStatus {
        &mut self.state
    }
}

#[instrument(skip_all, fields(path = %path.display()))]
fn read_status(path: &Path) -> Result<ExecutionStatus> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read status {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse status {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::test_support::{MemoryStateStore, job, module, state_of, write_plan};

    #[test]
    fn generate_orders_modules_by_dependency() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        write_plan(dir, "app", &["storage"], &[(1, ""), (2, "job_1")]);
        write_plan(dir, "storage", &[], &[(1, "")]);

        let state = generate_status(dir).expect("generate");
        let names: Vec<&str> = state.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["storage", "app"]);

        let app = state.module("app").expect("app");
        assert_eq!(app.dependencies, vec!["storage".to_string()]);
        assert_eq!(app.status, Status::Pending);
        let second = app.job("job_2").expect("job_2");
        assert_eq!(second.index, 2);
        assert_eq!(second.prerequisites, vec!["job_1".to_string()]);
        assert_eq!(second.tasks_total, 1);
        assert_eq!(second.tasks_completed, 0);
        assert_eq!(state.global.status, Status::Pending);
    }

    #[test]
    fn generate_rejects_cycles_and_empty_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let err = generate_status(dir).expect_err("empty");
        assert!(format!("{err:#}").contains("no plan files"));

        write_plan(dir, "a", &["b"], &[(1, "")]);
        write_plan(dir, "b", &["a"], &[(1, "")]);
        let err = generate_status(dir).expect_err("cycle");
        assert!(matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::CircularDependency { .. })
        ));
    }

    #[test]
    fn file_store_round_trips_with_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".morty/status.json");
        let state = state_of(vec![module("core", vec![job("job_1", 1, Status::Pending)])]);
        let before = state.global.last_update;

        let mut store = FileStateStore::new(&path, state);
        store.save().expect("save");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
        assert!(raw.contains("\"PENDING\""));

        let reopened = FileStateStore::open(&path).expect("open");
        assert_eq!(reopened.state(), store.state());
        assert!(reopened.state().global.last_update >= before);
    }

    #[test]
    fn update_job_status_validates_and_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        let state = state_of(vec![module("core", vec![job("job_1", 1, Status::Pending)])]);
        let mut store = FileStateStore::new(&path, state);

        store
            .update_job_status("core", "job_1", Status::Running)
            .expect("to running");
        let err = store
            .update_job_status("core", "job_1", Status::Pending)
            .expect_err("running -> pending");
        assert!(matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::InvalidTransition { .. })
        ));

        let mut reloaded = FileStateStore::open(&path).expect("open");
        reloaded.load().expect("load");
        assert_eq!(
            reloaded.job("core", "job_1").map(|j| j.status),
            Some(Status::Running)
        );
    }

    #[test]
    fn next_pending_job_follows_selection() {
        let mut store = MemoryStateStore::new(state_of(vec![module(
            "core",
            vec![
                job("job_1", 1, Status::Completed),
                job("job_2", 2, Status::Pending),
            ],
        )]));
        let next = store.next_pending_job().expect("select").expect("job");
        assert_eq!((next.module.as_str(), next.job.as_str()), ("core", "job_2"));

        store
            .update_job_status("core", "job_2", Status::Running)
            .expect("running");
        store
            .update_job_status("core", "job_2", Status::Completed)
            .expect("completed");
        assert!(store.next_pending_job().expect("select").is_none());
        assert_eq!(store.saves(), 2);
    }

    #[test]
    fn initialize_replaces_state_from_plans() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_plan(temp.path(), "solo", &[], &[(1, ""), (2, "")]);
        let mut store = MemoryStateStore::new(state_of(Vec::new()));

        store.initialize(temp.path()).expect("initialize");
        assert_eq!(store.state().modules.len(), 1);
        assert_eq!(store.state().job_counts().pending, 2);
    }
}
