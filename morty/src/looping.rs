//! The orchestration loop behind `morty doing`.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::selector::{BlockedJob, JobSelector, SelectOutcome, Target};
use crate::core::transitions::{ResetScope, apply_job_status, reset_jobs};
use crate::core::types::Status;
use crate::error::OrchestrationError;
use crate::io::agent::AgentRunner;
use crate::io::git::GitOps;
use crate::io::state_store::StateStore;
use crate::step::{JobFailed, StepEnv, StepOutcome, execute_job};

/// Recorded on jobs found RUNNING when a loop starts.
const STALE_RUNNING_REASON: &str = "interrupted before completion";

/// What `run_loop` should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub target: Target,
    /// Reset the target's scope (everything for [`Target::Auto`]) before running.
    pub restart: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            target: Target::Auto,
            restart: false,
        }
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every job is COMPLETED or nothing is left to schedule.
    NoPendingJobs,
    /// Pending jobs remain but none is executable.
    Blocked { pending: Vec<BlockedJob> },
    /// A job failed and the loop halted.
    Failed {
        module: String,
        job: String,
        error: String,
    },
    /// Cancellation was observed.
    Interrupted,
    /// A manual target ran its one job.
    SingleJobDone,
}

/// A failure the loop stepped over because `continue_on_error` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFailure {
    pub module: String,
    pub job: String,
    pub error: String,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Jobs that ran to success.
    pub steps_executed: u32,
    pub skipped_failures: Vec<SkippedFailure>,
    pub stop: LoopStop,
}

/// Select and execute jobs until nothing is executable, a job fails, or the
/// environment's cancellation fires.
///
/// A manual target runs exactly one job. A manual module target whose pending
/// jobs are all blocked fails with [`OrchestrationError::PrerequisiteUnmet`].
/// Errors raised before a job starts (unknown names, completed or exhausted
/// jobs, state I/O) are returned as errors rather than stop reasons.
#[instrument(skip_all, fields(target = ?options.target, restart = options.restart))]
pub fn run_loop<S, A, G, F>(
    store: &mut S,
    env: &StepEnv<'_, A, G>,
    options: &RunOptions,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    S: StateStore,
    A: AgentRunner,
    G: GitOps,
    F: FnMut(&StepOutcome),
{
    recover_stale_jobs(store)?;
    if options.restart {
        let scope = match &options.target {
            Target::Auto => ResetScope::All,
            Target::Module(module) => ResetScope::Module(module.clone()),
            Target::Job { module, job } => ResetScope::Job {
                module: module.clone(),
                job: job.clone(),
            },
        };
        let reset = reset_jobs(store.state_mut(), &scope, Utc::now())?;
        store.save().context("save restarted state")?;
        info!(reset, "restarted jobs");
    }

    let strict = env.config.execution.strict_prerequisites;
    let manual = options.target.is_manual();
    let mut steps_executed = 0u32;
    let mut skipped_failures = Vec::new();
    let finish = |steps_executed: u32,
                  skipped_failures: Vec<SkippedFailure>,
                  stop: LoopStop|
     -> Result<LoopOutcome> {
        info!(steps_executed, stop = ?stop, "loop stopped");
        Ok(LoopOutcome {
            steps_executed,
            skipped_failures,
            stop,
        })
    };

    loop {
        if env.cancel.is_cancelled() {
            return finish(steps_executed, skipped_failures, LoopStop::Interrupted);
        }

        let selected = match JobSelector::new(store.state())
            .strict(strict)
            .select(&options.target)?
        {
            SelectOutcome::Selected(selected) => selected,
            SelectOutcome::NoExecutableJob { blocked } if blocked.is_empty() => {
                return finish(steps_executed, skipped_failures, LoopStop::NoPendingJobs);
            }
            SelectOutcome::NoExecutableJob { blocked } => {
                if let Target::Module(_) = &options.target
                    && let Some(first) = blocked.first()
                {
                    return Err(OrchestrationError::PrerequisiteUnmet {
                        module: first.module.clone(),
                        job: first.job.clone(),
                        unmet: first.reasons.clone(),
                    }
                    .into());
                }
                return finish(
                    steps_executed,
                    skipped_failures,
                    LoopStop::Blocked { pending: blocked },
                );
            }
        };

        if !selected.prereqs.is_satisfied() {
            warn!(
                module = %selected.module,
                job = %selected.job,
                unmet = %selected.prereqs.unmet_descriptions().join(", "),
                "running explicitly targeted job with unmet prerequisites"
            );
        }

        match execute_job(store, env, &selected.module, &selected.job) {
            Ok(step) => {
                steps_executed += 1;
                on_step(&step);
                if manual {
                    return finish(steps_executed, skipped_failures, LoopStop::SingleJobDone);
                }
            }
            Err(err) => {
                let Some(failed) = err.downcast_ref::<JobFailed>().cloned() else {
                    return Err(err);
                };
                if env.cancel.is_cancelled() {
                    return finish(steps_executed, skipped_failures, LoopStop::Interrupted);
                }
                let error = format!("{err:#}");
                if env.config.execution.continue_on_error && !manual {
                    warn!(module = %failed.module, job = %failed.job, error = %error, "continuing past failed job");
                    skipped_failures.push(SkippedFailure {
                        module: failed.module,
                        job: failed.job,
                        error,
                    });
                    continue;
                }
                return finish(
                    steps_executed,
                    skipped_failures,
                    LoopStop::Failed {
                        module: failed.module,
                        job: failed.job,
                        error,
                    },
                );
            }
        }
    }
}

/// Mark jobs left RUNNING by a previous process as FAILED so they can be retried.
fn recover_stale_jobs<S: StateStore>(store: &mut S) -> Result<usize> {
    let stale: Vec<(String, String)> = store
        .state()
        .modules
        .iter()
        .flat_map(|m| {
            m.jobs
                .iter()
                .filter(|j| j.status == Status::Running)
                .map(move |j| (m.name.clone(), j.name.clone()))
        })
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }
    let now = Utc::now();
    let state = store.state_mut();
    for (module, job) in &stale {
        warn!(module = %module, job = %job, "recovering job left RUNNING");
        apply_job_status(state, module, job, Status::Failed, now)?;
        if let Some(entry) = state.job_mut(module, job) {
            entry.failure_reason = Some(STALE_RUNNING_REASON.to_string());
        }
    }
    state.global.status = Status::Failed;
    store.save().context("save recovered state")?;
    Ok(stale.len())
}
