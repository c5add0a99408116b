//! Deterministic next-job selection.

use crate::core::graph::DependencyGraph;
use crate::core::prereq::{PrereqCheck, PrerequisiteResolver};
use crate::core::types::{ExecutionStatus, Job, Module, Status};
use crate::error::OrchestrationError;

/// What the operator asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Continuous auto-selection across all modules.
    Auto,
    /// Next executable job within one module.
    Module(String),
    /// One explicit job. Prerequisites are not checked.
    Job { module: String, job: String },
}

impl Target {
    /// Build a target from optional CLI arguments. A job without a module is rejected.
    pub fn from_parts(module: Option<String>, job: Option<String>) -> Result<Self, OrchestrationError> {
        match (module, job) {
            (None, None) => Ok(Target::Auto),
            (Some(module), None) => Ok(Target::Module(module)),
            (Some(module), Some(job)) => Ok(Target::Job { module, job }),
            (None, Some(job)) => Err(OrchestrationError::InvalidSelection(format!(
                "job '{job}' requires a module"
            ))),
        }
    }

    pub fn is_manual(&self) -> bool {
        !matches!(self, Target::Auto)
    }
}

/// A job chosen for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedJob {
    pub module: String,
    pub job: String,
    pub module_index: usize,
    pub job_index: usize,
    /// Prerequisite diagnostics gathered during selection.
    pub prereqs: PrereqCheck,
}

/// A pending job that could not be selected, with the reasons why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedJob {
    pub module: String,
    pub job: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Selected(SelectedJob),
    /// No job is executable. `blocked` is empty when nothing is pending at all.
    NoExecutableJob { blocked: Vec<BlockedJob> },
}

/// Picks exactly one next job from an [`ExecutionStatus`].
pub struct JobSelector<'a> {
    state: &'a ExecutionStatus,
    graph: DependencyGraph,
    strict: bool,
}

impl<'a> JobSelector<'a> {
    pub fn new(state: &'a ExecutionStatus) -> Self {
        let graph = DependencyGraph::from_expanded(
            state
                .modules
                .iter()
                .map(|m| (m.name.as_str(), m.dependencies.as_slice())),
        );
        Self {
            state,
            graph,
            strict: false,
        }
    }

    /// Treat references to missing jobs as unmet.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn select(&self, target: &Target) -> Result<SelectOutcome, OrchestrationError> {
        match target {
            Target::Auto => self.select_auto(),
            Target::Module(module) => {
                let found = self
                    .state
                    .module(module)
                    .ok_or_else(|| OrchestrationError::UnknownModule(module.clone()))?;
                let mut blocked = Vec::new();
                Ok(match self.first_executable(found, &mut blocked) {
                    Some(selected) => SelectOutcome::Selected(selected),
                    None => SelectOutcome::NoExecutableJob { blocked },
                })
            }
            Target::Job { module, job } => {
                let (module_index, job_index) =
                    self.state.position(module, job).ok_or_else(|| {
                        if self.state.module(module).is_none() {
                            OrchestrationError::UnknownModule(module.clone())
                        } else {
                            OrchestrationError::UnknownJob {
                                module: module.clone(),
                                job: job.clone(),
                            }
                        }
                    })?;
                Ok(SelectOutcome::Selected(SelectedJob {
                    module: module.clone(),
                    job: job.clone(),
                    module_index,
                    job_index,
                    prereqs: self.resolver().check(module, job),
                }))
            }
        }
    }

    /// Walk modules in dependency order and return the first executable job.
    fn select_auto(&self) -> Result<SelectOutcome, OrchestrationError> {
        let order = self.graph.topological_order()?;
        let mut blocked = Vec::new();
        for name in &order {
            let Some(module) = self.state.module(name) else {
                continue;
            };
            if module.status == Status::Completed {
                continue;
            }
            let waiting_on = self.incomplete_dependencies(name);
            if !waiting_on.is_empty() {
                for job in pending_jobs(module) {
                    blocked.push(BlockedJob {
                        module: module.name.clone(),
                        job: job.name.clone(),
                        reasons: waiting_on
                            .iter()
                            .map(|dep| format!("module {dep} is not COMPLETED"))
                            .collect(),
                    });
                }
                continue;
            }
            if let Some(selected) = self.first_executable(module, &mut blocked) {
                return Ok(SelectOutcome::Selected(selected));
            }
        }
        Ok(SelectOutcome::NoExecutableJob { blocked })
    }

    /// First PENDING job in plan-index order with no unmet prerequisites.
    fn first_executable(&self, module: &Module, blocked: &mut Vec<BlockedJob>) -> Option<SelectedJob> {
        let resolver = self.resolver();
        for job in pending_jobs(module) {
            let check = resolver.check(&module.name, &job.name);
            if check.is_satisfied() {
                let (module_index, job_index) = self.state.position(&module.name, &job.name)?;
                return Some(SelectedJob {
                    module: module.name.clone(),
                    job: job.name.clone(),
                    module_index,
                    job_index,
                    prereqs: check,
                });
            }
            blocked.push(BlockedJob {
                module: module.name.clone(),
                job: job.name.clone(),
                reasons: check.unmet_descriptions(),
            });
        }
        None
    }

    fn incomplete_dependencies(&self, module: &str) -> Vec<String> {
        self.graph
            .dependencies(module)
            .into_iter()
            .flatten()
            .filter(|dep| {
                self.state
                    .module(dep)
                    .is_some_and(|m| m.status != Status::Completed)
            })
            .cloned()
            .collect()
    }

    fn resolver(&self) -> PrerequisiteResolver<'a> {
        PrerequisiteResolver::new(self.state).strict(self.strict)
    }
}

fn pending_jobs(module: &Module) -> Vec<&Job> {
    let mut jobs: Vec<&Job> = module
        .jobs
        .iter()
        .filter(|job| job.status == Status::Pending)
        .collect();
    jobs.sort_by_key(|job| job.order_key());
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job, job_with_prereqs, module, module_with_deps, state_of};

    fn selected(outcome: SelectOutcome) -> (String, String) {
        match outcome {
            SelectOutcome::Selected(s) => (s.module, s.job),
            SelectOutcome::NoExecutableJob { blocked } => {
                panic!("expected selection, got blocked {blocked:?}")
            }
        }
    }

    fn complete(state: &mut ExecutionStatus, module: &str) {
        let m = state.module_mut(module).expect("module");
        for j in &mut m.jobs {
            j.status = Status::Completed;
        }
        m.status = Status::Completed;
    }

    /// Two modules, B depends on A, two jobs each: A's jobs run first,
    /// then B's, then nothing is left.
    #[test]
    fn walks_modules_in_dependency_order() {
        let mut state = state_of(vec![
            module_with_deps(
                "b",
                &["a"],
                vec![job("job_1", 1, Status::Pending), job("job_2", 2, Status::Pending)],
            ),
            module(
                "a",
                vec![job("job_1", 1, Status::Pending), job("job_2", 2, Status::Pending)],
            ),
        ]);

        let first = JobSelector::new(&state).select(&Target::Auto).expect("select");
        assert_eq!(selected(first), ("a".to_string(), "job_1".to_string()));

        complete(&mut state, "a");
        let next = JobSelector::new(&state).select(&Target::Auto).expect("select");
        assert_eq!(selected(next), ("b".to_string(), "job_1".to_string()));

        complete(&mut state, "b");
        let done = JobSelector::new(&state).select(&Target::Auto).expect("select");
        assert_eq!(done, SelectOutcome::NoExecutableJob { blocked: Vec::new() });
    }

    #[test]
    fn pending_jobs_sort_by_plan_index_not_position() {
        let state = state_of(vec![module(
            "m",
            vec![
                job("job_3", 3, Status::Pending),
                job("job_1", 1, Status::Completed),
                job("job_2", 2, Status::Pending),
            ],
        )]);
        let outcome = JobSelector::new(&state).select(&Target::Auto).expect("select");
        match outcome {
            SelectOutcome::Selected(s) => {
                assert_eq!(s.job, "job_2");
                assert_eq!(s.job_index, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn skips_jobs_with_unmet_prerequisites() {
        let state = state_of(vec![module(
            "m",
            vec![
                job_with_prereqs("job_1", 1, Status::Pending, &["job_2"]),
                job("job_2", 2, Status::Pending),
            ],
        )]);
        let outcome = JobSelector::new(&state).select(&Target::Auto).expect("select");
        assert_eq!(selected(outcome), ("m".to_string(), "job_2".to_string()));
    }

    /// Verifies a dependent module is never entered while its dependency is
    /// unfinished, even when its own jobs have no prerequisites.
    #[test]
    fn never_selects_from_module_with_incomplete_dependency() {
        let state = state_of(vec![
            module(
                "a",
                vec![
                    job("job_1", 1, Status::Completed),
                    job_with_prereqs("job_2", 2, Status::Pending, &["job_3"]),
                    job("job_3", 3, Status::Failed),
                ],
            ),
            module_with_deps("b", &["a"], vec![job("job_1", 1, Status::Pending)]),
        ]);
        let outcome = JobSelector::new(&state).select(&Target::Auto).expect("select");
        let SelectOutcome::NoExecutableJob { blocked } = outcome else {
            panic!("expected no executable job");
        };
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked[0].job, "job_2");
        assert_eq!(blocked[1].module, "b");
        assert_eq!(blocked[1].reasons, vec!["module a is not COMPLETED"]);
    }

    #[test]
    fn job_without_module_is_invalid() {
        let err = Target::from_parts(None, Some("job_1".to_string())).expect_err("invalid");
        assert!(matches!(err, OrchestrationError::InvalidSelection(_)));
        assert_eq!(
            Target::from_parts(Some("m".to_string()), None),
            Ok(Target::Module("m".to_string()))
        );
    }

    #[test]
    fn explicit_job_bypasses_prerequisites_but_not_existence() {
        let state = state_of(vec![module(
            "m",
            vec![
                job("job_1", 1, Status::Pending),
                job_with_prereqs("job_2", 2, Status::Pending, &["job_1"]),
            ],
        )]);
        let selector = JobSelector::new(&state);
        let target = Target::Job {
            module: "m".to_string(),
            job: "job_2".to_string(),
        };
        match selector.select(&target).expect("select") {
            SelectOutcome::Selected(s) => {
                assert_eq!(s.job, "job_2");
                assert!(!s.prereqs.is_satisfied());
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = Target::Job {
            module: "m".to_string(),
            job: "job_9".to_string(),
        };
        assert!(matches!(
            selector.select(&missing),
            Err(OrchestrationError::UnknownJob { .. })
        ));
        assert!(matches!(
            selector.select(&Target::Module("nope".to_string())),
            Err(OrchestrationError::UnknownModule(_))
        ));
    }

    #[test]
    fn cycle_aborts_auto_selection() {
        let state = state_of(vec![
            module_with_deps("a", &["b"], vec![job("job_1", 1, Status::Pending)]),
            module_with_deps("b", &["a"], vec![job("job_1", 1, Status::Pending)]),
        ]);
        let err = JobSelector::new(&state)
            .select(&Target::Auto)
            .expect_err("cycle");
        assert!(matches!(err, OrchestrationError::CircularDependency { .. }));
    }
}
