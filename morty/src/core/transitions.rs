//! Status transition rules and bulk resets.
//!
//! All mutation of job status goes through [`apply_job_status`] so that the
//! transition table, retry counting, and module status derivation stay in one
//! place.

use chrono::{DateTime, Utc};

use crate::core::types::{ExecutionStatus, Job, Status};
use crate::error::OrchestrationError;

/// Whether `from -> to` is an allowed job transition. Same-state writes are allowed.
pub fn is_valid_transition(from: Status, to: Status) -> bool {
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Status::Pending, Status::Running)
            | (Status::Pending, Status::Blocked)
            | (Status::Running, Status::Completed)
            | (Status::Running, Status::Failed)
            | (Status::Running, Status::Blocked)
            | (Status::Failed, Status::Pending)
            | (Status::Blocked, Status::Pending)
    )
}

/// Derive a module's status from its jobs.
///
/// COMPLETED iff every job is COMPLETED, then RUNNING, FAILED, BLOCKED in
/// priority order. A module with no jobs is PENDING.
pub fn module_status(jobs: &[Job]) -> Status {
    if jobs.is_empty() {
        return Status::Pending;
    }
    if jobs.iter().all(|job| job.status == Status::Completed) {
        return Status::Completed;
    }
    [Status::Running, Status::Failed, Status::Blocked]
        .into_iter()
        .find(|status| jobs.iter().any(|job| job.status == *status))
        .unwrap_or(Status::Pending)
}

/// Re-derive every module status and the global status.
pub fn refresh_statuses(state: &mut ExecutionStatus) {
    for module in &mut state.modules {
        module.status = module_status(&module.jobs);
    }
    if !state.modules.is_empty()
        && state
            .modules
            .iter()
            .all(|module| module.status == Status::Completed)
    {
        state.global.status = Status::Completed;
    }
}

/// Move one job to `to`, validating the transition.
///
/// FAILED -> PENDING counts as a retry. Leaving FAILED clears the failure
/// reason. The owning module's status is re-derived.
pub fn apply_job_status(
    state: &mut ExecutionStatus,
    module: &str,
    job: &str,
    to: Status,
    now: DateTime<Utc>,
) -> Result<(), OrchestrationError> {
    let target = state
        .module_mut(module)
        .ok_or_else(|| OrchestrationError::UnknownModule(module.to_string()))?;
    let entry = target
        .job_mut(job)
        .ok_or_else(|| OrchestrationError::UnknownJob {
            module: module.to_string(),
            job: job.to_string(),
        })?;

    let from = entry.status;
    if !is_valid_transition(from, to) {
        return Err(OrchestrationError::InvalidTransition {
            module: module.to_string(),
            job: job.to_string(),
            from,
            to,
        });
    }
    if from == Status::Failed && to == Status::Pending {
        entry.retry_count += 1;
    }
    if to != Status::Failed {
        entry.failure_reason = None;
    }
    entry.status = to;
    entry.updated_at = now;
    target.status = module_status(&target.jobs);
    Ok(())
}

/// Scope of an explicit restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Module(String),
    Job { module: String, job: String },
}

/// Reset jobs in `scope` to a fresh PENDING state.
///
/// Resetting everything also rewinds the global cursor.
pub fn reset_jobs(
    state: &mut ExecutionStatus,
    scope: &ResetScope,
    now: DateTime<Utc>,
) -> Result<usize, OrchestrationError> {
    let mut reset = 0usize;
    match scope {
        ResetScope::All => {
            for job in state.modules.iter_mut().flat_map(|m| m.jobs.iter_mut()) {
                reset_job(job, now);
                reset += 1;
            }
            state.global.status = Status::Pending;
            state.global.current_module_index = 0;
            state.global.current_job_index = 0;
        }
        ResetScope::Module(module) => {
            let target = state
                .module_mut(module)
                .ok_or_else(|| OrchestrationError::UnknownModule(module.clone()))?;
            for job in &mut target.jobs {
                reset_job(job, now);
                reset += 1;
            }
        }
        ResetScope::Job { module, job } => {
            let target = state
                .module_mut(module)
                .ok_or_else(|| OrchestrationError::UnknownModule(module.clone()))?;
            let entry = target
                .job_mut(job)
                .ok_or_else(|| OrchestrationError::UnknownJob {
                    module: module.clone(),
                    job: job.clone(),
                })?;
            reset_job(entry, now);
            reset = 1;
        }
    }
    refresh_statuses(state);
    if state.global.status == Status::Completed
        && state.modules.iter().any(|m| m.status != Status::Completed)
    {
        state.global.status = Status::Pending;
    }
    Ok(reset)
}

fn reset_job(job: &mut Job, now: DateTime<Utc>) {
    job.status = Status::Pending;
    job.loop_count = 0;
    job.retry_count = 0;
    job.tasks_completed = 0;
    job.failure_reason = None;
    job.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job, module, state_of};

    #[test]
    fn transition_table() {
        assert!(is_valid_transition(Status::Pending, Status::Running));
        assert!(is_valid_transition(Status::Running, Status::Completed));
        assert!(is_valid_transition(Status::Failed, Status::Pending));
        assert!(is_valid_transition(Status::Blocked, Status::Pending));
        assert!(is_valid_transition(Status::Completed, Status::Completed));
        assert!(!is_valid_transition(Status::Completed, Status::Pending));
        assert!(!is_valid_transition(Status::Pending, Status::Completed));
        assert!(!is_valid_transition(Status::Failed, Status::Running));
    }

    #[test]
    fn module_status_priority() {
        let now = Utc::now();
        let with = |statuses: &[Status]| -> Vec<Job> {
            statuses
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let mut j = Job::new(format!("job_{}", i + 1), i as u32 + 1, now);
                    j.status = *s;
                    j
                })
                .collect()
        };
        assert_eq!(module_status(&[]), Status::Pending);
        assert_eq!(
            module_status(&with(&[Status::Completed, Status::Completed])),
            Status::Completed
        );
        assert_eq!(
            module_status(&with(&[Status::Failed, Status::Running])),
            Status::Running
        );
        assert_eq!(
            module_status(&with(&[Status::Blocked, Status::Failed])),
            Status::Failed
        );
        assert_eq!(
            module_status(&with(&[Status::Pending, Status::Blocked])),
            Status::Blocked
        );
        assert_eq!(
            module_status(&with(&[Status::Completed, Status::Pending])),
            Status::Pending
        );
    }

    #[test]
    fn retry_increments_counter_and_clears_reason() {
        let mut state = state_of(vec![module("m", vec![job("job_1", 1, Status::Failed)])]);
        state.modules[0].jobs[0].failure_reason = Some("boom".to_string());

        apply_job_status(&mut state, "m", "job_1", Status::Pending, Utc::now()).expect("retry");

        let j = state.job("m", "job_1").expect("job");
        assert_eq!(j.retry_count, 1);
        assert_eq!(j.failure_reason, None);
        assert_eq!(state.modules[0].status, Status::Pending);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut state = state_of(vec![module("m", vec![job("job_1", 1, Status::Completed)])]);
        let err = apply_job_status(&mut state, "m", "job_1", Status::Running, Utc::now())
            .expect_err("completed is terminal");
        assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    }

    #[test]
    fn unknown_targets_are_reported() {
        let mut state = state_of(vec![module("m", vec![job("job_1", 1, Status::Pending)])]);
        assert_eq!(
            apply_job_status(&mut state, "x", "job_1", Status::Running, Utc::now()),
            Err(OrchestrationError::UnknownModule("x".to_string()))
        );
        assert!(matches!(
            reset_jobs(
                &mut state,
                &ResetScope::Job {
                    module: "m".to_string(),
                    job: "job_7".to_string()
                },
                Utc::now()
            ),
            Err(OrchestrationError::UnknownJob { .. })
        ));
    }

    #[test]
    fn reset_all_rewinds_counters_and_cursor() {
        let mut state = state_of(vec![
            module("a", vec![job("job_1", 1, Status::Completed)]),
            module("b", vec![job("job_1", 1, Status::Failed)]),
        ]);
        state.modules[1].jobs[0].retry_count = 2;
        state.modules[1].jobs[0].loop_count = 3;
        state.global.current_module_index = 1;
        state.global.status = Status::Running;

        let n = reset_jobs(&mut state, &ResetScope::All, Utc::now()).expect("reset");

        assert_eq!(n, 2);
        for j in state.modules.iter().flat_map(|m| m.jobs.iter()) {
            assert_eq!(j.status, Status::Pending);
            assert_eq!(j.retry_count, 0);
            assert_eq!(j.loop_count, 0);
        }
        assert_eq!(state.global.status, Status::Pending);
        assert_eq!(state.global.current_module_index, 0);
    }

    #[test]
    fn reset_single_job_rederives_module() {
        let mut state = state_of(vec![module(
            "a",
            vec![job("job_1", 1, Status::Completed), job("job_2", 2, Status::Failed)],
        )]);
        assert_eq!(state.modules[0].status, Status::Failed);

        reset_jobs(
            &mut state,
            &ResetScope::Job {
                module: "a".to_string(),
                job: "job_2".to_string(),
            },
            Utc::now(),
        )
        .expect("reset");

        assert_eq!(state.modules[0].status, Status::Pending);
        assert_eq!(
            state.job("a", "job_1").map(|j| j.status),
            Some(Status::Completed)
        );
    }
}
