//! Execution of a single job: state transitions, agent run, checkpoint.

use std::fmt;
use std::fs;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, info_span, instrument, warn};

use crate::core::prereq::Prerequisite;
use crate::core::transitions::{apply_job_status, refresh_statuses};
use crate::core::types::{ExecutionStatus, Status};
use crate::error::OrchestrationError;
use crate::io::agent::{AgentRequest, AgentRunner, PromptContext, build_prompt};
use crate::io::cancel::Cancellation;
use crate::io::checkpoint::{CheckpointOutcome, Checkpointer};
use crate::io::config::MortyConfig;
use crate::io::git::GitOps;
use crate::io::init::MortyPaths;
use crate::io::plan::{PlanJob, parse_plan};
use crate::io::process::{ProcessError, ProcessResult};
use crate::io::state_store::StateStore;

/// Characters of agent output kept in a failure reason.
const FAILURE_TAIL_CHARS: usize = 400;

/// Everything a step needs besides the state.
pub struct StepEnv<'a, A: AgentRunner, G: GitOps> {
    pub paths: &'a MortyPaths,
    pub config: &'a MortyConfig,
    pub agent: &'a A,
    pub checkpointer: &'a Checkpointer<G>,
    pub cancel: &'a Cancellation,
}

/// A job that ran to success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub module: String,
    pub job: String,
    pub loop_number: u32,
    pub result: ProcessResult,
    /// `None` when auto-commit is off.
    pub checkpoint: Option<CheckpointOutcome>,
}

/// Context attached to every error raised after a job started running.
///
/// The underlying typed error (for example
/// [`OrchestrationError::ProcessTimedOut`]) stays reachable with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailed {
    pub module: String,
    pub job: String,
}

impl fmt::Display for JobFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {}/{} failed", self.module, self.job)
    }
}

/// Run `module`/`job` once.
///
/// COMPLETED jobs are refused. FAILED jobs are retried (counting the retry)
/// until `max_retries` is reached. On agent failure the job is left FAILED
/// with a reason; on success it is COMPLETED and, with auto-commit, checkpointed.
#[instrument(skip_all, fields(module, job))]
pub fn execute_job<S, A, G>(
    store: &mut S,
    env: &StepEnv<'_, A, G>,
    module: &str,
    job: &str,
) -> Result<StepOutcome>
where
    S: StateStore,
    A: AgentRunner,
    G: GitOps,
{
    prepare_job(store, env.config, module, job)?;

    let loop_number = next_loop_number(env, store.state())?;
    let (module_index, job_index) = store
        .state()
        .position(module, job)
        .ok_or_else(|| OrchestrationError::UnknownJob {
            module: module.to_string(),
            job: job.to_string(),
        })?;
    let now = Utc::now();
    {
        let state = store.state_mut();
        apply_job_status(state, module, job, Status::Running, now)?;
        if let Some(entry) = state.job_mut(module, job) {
            entry.loop_count += 1;
        }
        state.global.status = Status::Running;
        state.global.current_module_index = module_index;
        state.global.current_job_index = job_index;
    }
    store.save().context("save RUNNING state")?;
    info!(loop_number, "job started");

    let request = AgentRequest {
        module: module.to_string(),
        job: job.to_string(),
        prompt: job_prompt(env, store.state(), module, job, loop_number)?,
        workdir: env.paths.root.clone(),
        log_path: Some(env.paths.agent_log_path(module, job, loop_number)),
    };
    let outcome = {
        let _span = info_span!("agent", loop_number).entered();
        env.agent.run(&request, env.cancel)
    };

    let failed = JobFailed {
        module: module.to_string(),
        job: job.to_string(),
    };
    let result = match outcome {
        Ok(result) if result.success() => result,
        Ok(result) => {
            let tail = result.output_tail(FAILURE_TAIL_CHARS);
            let reason = if tail.is_empty() {
                format!("agent exited with code {}", result.exit_code)
            } else {
                format!("agent exited with code {}: {tail}", result.exit_code)
            };
            record_failure(store, module, job, &reason)?;
            return Err(anyhow!(reason).context(failed));
        }
        Err(err) => {
            record_failure(store, module, job, &err.to_string())?;
            return Err(process_failure(err).context(failed));
        }
    };

    {
        let state = store.state_mut();
        apply_job_status(state, module, job, Status::Completed, Utc::now())?;
        if let Some(entry) = state.job_mut(module, job) {
            entry.tasks_completed = entry.tasks_total;
        }
        state.global.status = Status::Pending;
        refresh_statuses(state);
    }
    store.save().context("save COMPLETED state")?;
    info!(outcome = "success", loop_number, "job completed");

    let checkpoint = if env.config.execution.auto_commit {
        match env.checkpointer.commit_loop(loop_number, Status::Completed.as_str()) {
            Ok(checkpoint) => {
                debug!(hash = ?checkpoint.hash, "checkpoint recorded");
                Some(checkpoint)
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "checkpoint failed after successful job");
                let typed = OrchestrationError::CommitFailed {
                    module: module.to_string(),
                    job: job.to_string(),
                    reason: format!("{err:#}"),
                };
                return Err(anyhow::Error::new(typed).context(failed));
            }
        }
    } else {
        None
    };

    Ok(StepOutcome {
        module: module.to_string(),
        job: job.to_string(),
        loop_number,
        result,
        checkpoint,
    })
}

/// Move a FAILED or BLOCKED job back to PENDING, refusing COMPLETED jobs and
/// exhausted retries.
fn prepare_job<S: StateStore>(
    store: &mut S,
    config: &MortyConfig,
    module: &str,
    job: &str,
) -> Result<()> {
    let entry = store.job(module, job).ok_or_else(|| {
        if store.state().module(module).is_none() {
            OrchestrationError::UnknownModule(module.to_string())
        } else {
            OrchestrationError::UnknownJob {
                module: module.to_string(),
                job: job.to_string(),
            }
        }
    })?;
    match entry.status {
        Status::Pending | Status::Running => Ok(()),
        Status::Completed => Err(OrchestrationError::InvalidTransition {
            module: module.to_string(),
            job: job.to_string(),
            from: Status::Completed,
            to: Status::Running,
        }
        .into()),
        Status::Failed if entry.retry_count >= config.execution.max_retries => {
            Err(OrchestrationError::RetryLimitExceeded {
                module: module.to_string(),
                job: job.to_string(),
                retries: entry.retry_count,
                max: config.execution.max_retries,
            }
            .into())
        }
        Status::Failed | Status::Blocked => {
            info!(from = %entry.status, "returning job to PENDING");
            store.update_job_status(module, job, Status::Pending)
        }
    }
}

fn next_loop_number<A: AgentRunner, G: GitOps>(
    env: &StepEnv<'_, A, G>,
    state: &ExecutionStatus,
) -> Result<u32> {
    if env.config.execution.auto_commit {
        return env.checkpointer.next_loop_number();
    }
    let ran: u32 = state
        .modules
        .iter()
        .flat_map(|m| &m.jobs)
        .map(|j| j.loop_count)
        .sum();
    Ok(ran + 1)
}

fn record_failure<S: StateStore>(store: &mut S, module: &str, job: &str, reason: &str) -> Result<()> {
    warn!(reason, "job failed");
    let state = store.state_mut();
    apply_job_status(state, module, job, Status::Failed, Utc::now())?;
    if let Some(entry) = state.job_mut(module, job) {
        entry.failure_reason = Some(reason.to_string());
    }
    state.global.status = Status::Failed;
    store.save().context("save FAILED state")
}

fn process_failure(err: ProcessError) -> anyhow::Error {
    match OrchestrationError::from_process(&err) {
        Some(typed) => anyhow::Error::new(typed),
        None => anyhow::Error::new(err),
    }
}

fn job_prompt<A: AgentRunner, G: GitOps>(
    env: &StepEnv<'_, A, G>,
    state: &ExecutionStatus,
    module: &str,
    job: &str,
    loop_number: u32,
) -> Result<String> {
    let preamble = match &env.paths.prompt_path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("read prompt file {}", path.display()))?,
        ),
        None => None,
    };
    let module_state = state
        .module(module)
        .ok_or_else(|| OrchestrationError::UnknownModule(module.to_string()))?;
    let job_state = module_state
        .job(job)
        .ok_or_else(|| OrchestrationError::UnknownJob {
            module: module.to_string(),
            job: job.to_string(),
        })?;

    let planned = plan_job(env.paths, &module_state.plan_file, module, job_state.index);
    let prerequisites = prerequisite_lines(state, module, &job_state.prerequisites);
    Ok(build_prompt(&PromptContext {
        preamble: preamble.as_deref(),
        module,
        module_display_name: &module_state.display_name,
        job,
        job_title: planned.as_ref().map_or("", |p| p.title.as_str()),
        job_body: planned.as_ref().map_or("", |p| p.body.as_str()),
        prerequisites: &prerequisites,
        loop_number,
    }))
}

/// The job's plan section, if the plan file is still readable.
fn plan_job(paths: &MortyPaths, plan_file: &str, module: &str, index: u32) -> Option<PlanJob> {
    let path = paths.plan_dir.join(plan_file);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "plan file unreadable, prompt has no job body");
            return None;
        }
    };
    let (plan, _) = parse_plan(module, plan_file, &content);
    plan.jobs.into_iter().find(|j| j.index == index)
}

/// One line per prerequisite with the referenced job's current status.
fn prerequisite_lines(state: &ExecutionStatus, module: &str, prereqs: &[String]) -> Vec<String> {
    prereqs
        .iter()
        .map(|raw| {
            let (ref_module, index) = match Prerequisite::parse(raw) {
                Prerequisite::SameModule { index } => (module.to_string(), index),
                Prerequisite::CrossModule { module, index } => (module, index),
                Prerequisite::Descriptive(text) => return text,
            };
            let status = state
                .module(&ref_module)
                .and_then(|m| m.job_by_index(index))
                .map_or("missing", |j| j.status.as_str());
            format!("{raw} [{status}]")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::git::Git;
    use crate::io::state_store::generate_status;
    use crate::test_support::{MemoryStateStore, ScriptedAgent, TestRepo, process_result};

    struct Fixture {
        repo: TestRepo,
        paths: MortyPaths,
        config: MortyConfig,
        checkpointer: Checkpointer<Git>,
        cancel: Cancellation,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TestRepo::new().expect("repo");
            repo.write_plan("core", &[], &[(1, ""), (2, "job_1")]);
            let paths = MortyPaths::new(repo.path());
            let checkpointer = Checkpointer::new(Git::new(repo.path()));
            Self {
                repo,
                paths,
                config: MortyConfig::default(),
                checkpointer,
                cancel: Cancellation::new(),
            }
        }

        fn store(&self) -> MemoryStateStore {
            MemoryStateStore::new(generate_status(&self.paths.plan_dir).expect("generate"))
        }

        fn env<'a>(&'a self, agent: &'a ScriptedAgent) -> StepEnv<'a, ScriptedAgent, Git> {
            StepEnv {
                paths: &self.paths,
                config: &self.config,
                agent,
                checkpointer: &self.checkpointer,
                cancel: &self.cancel,
            }
        }
    }

    #[test]
    fn success_completes_job_and_commits_loop() {
        let fx = Fixture::new();
        let agent = ScriptedAgent::new().touching_files();
        let mut store = fx.store();

        let outcome = execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect("step");

        assert_eq!(outcome.loop_number, 1);
        assert!(outcome.checkpoint.as_ref().is_some_and(CheckpointOutcome::committed));
        let job = store.job("core", "job_1").expect("job");
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.loop_count, 1);
        assert_eq!(job.tasks_completed, job.tasks_total);
        assert_eq!(fx.repo.head_subject().expect("subject"), "morty: loop 1 - COMPLETED");
        assert_eq!(store.state().global.current_job_index, 0);
    }

    #[test]
    fn prompt_carries_plan_body_and_prerequisite_status() {
        let fx = Fixture::new();
        let agent = ScriptedAgent::new().touching_files();
        let mut store = fx.store();
        execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect("job_1");
        execute_job(&mut store, &fx.env(&agent), "core", "job_2").expect("job_2");

        let requests = agent.requests();
        let prompt = &requests[1].prompt;
        assert!(prompt.contains("## Job: job_2 - core job 2"));
        assert!(prompt.contains("implement core job 2"));
        assert!(prompt.contains("- job_1 [COMPLETED]"));
        assert_eq!(
            requests[1].log_path,
            Some(fx.paths.agent_log_path("core", "job_2", 2))
        );
    }

    #[test]
    fn nonzero_exit_marks_failed_with_reason() {
        let fx = Fixture::new();
        let agent = ScriptedAgent::new().then_exit(2);
        let mut store = fx.store();

        let err = execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect_err("fails");

        assert_eq!(
            err.downcast_ref::<JobFailed>(),
            Some(&JobFailed {
                module: "core".to_string(),
                job: "job_1".to_string()
            })
        );
        let job = store.job("core", "job_1").expect("job");
        assert_eq!(job.status, Status::Failed);
        assert!(
            job.failure_reason
                .as_deref()
                .is_some_and(|r| r.starts_with("agent exited with code 2"))
        );
        assert_eq!(store.state().module("core").map(|m| m.status), Some(Status::Failed));
        assert_eq!(fx.repo.commit_count().expect("count"), 1);
    }

    #[test]
    fn timeout_surfaces_typed_error_with_partial_result() {
        let fx = Fixture::new();
        let agent = ScriptedAgent::new().then_time_out();
        let mut store = fx.store();

        let err = execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect_err("timeout");

        let typed = err.downcast_ref::<OrchestrationError>().expect("typed");
        let result = typed.process_result().expect("partial result");
        assert!(result.timed_out && result.interrupted);
        assert_eq!(store.job("core", "job_1").map(|j| j.status), Some(Status::Failed));
    }

    #[test]
    fn completed_job_is_refused() {
        let fx = Fixture::new();
        let agent = ScriptedAgent::new();
        let mut store = fx.store();
        execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect("first");

        let err = execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect_err("again");
        assert!(matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::InvalidTransition {
                from: Status::Completed,
                ..
            })
        ));
        assert!(err.downcast_ref::<JobFailed>().is_none());
        assert_eq!(agent.calls().len(), 1);
    }

    #[test]
    fn failed_job_retries_until_limit() {
        let mut fx = Fixture::new();
        fx.config.execution.max_retries = 1;
        let agent = ScriptedAgent::new().then_exit(1).then_exit(1);
        let mut store = fx.store();

        execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect_err("first");
        execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect_err("retry");
        assert_eq!(store.job("core", "job_1").map(|j| j.retry_count), Some(1));

        let err = execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect_err("limit");
        assert!(matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::RetryLimitExceeded { retries: 1, max: 1, .. })
        ));
        assert_eq!(agent.calls().len(), 2);
    }

    #[test]
    fn auto_commit_outside_repository_fails_before_agent_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        crate::test_support::write_plan(&temp.path().join(".morty/plan"), "core", &[], &[(1, "")]);
        let paths = MortyPaths::new(temp.path());
        let mut config = MortyConfig::default();
        config.execution.auto_commit = true;
        let checkpointer = Checkpointer::new(Git::new(temp.path()));
        let cancel = Cancellation::new();
        let agent = ScriptedAgent::new().then(Ok(process_result(0)));
        let env = StepEnv {
            paths: &paths,
            config: &config,
            agent: &agent,
            checkpointer: &checkpointer,
            cancel: &cancel,
        };
        let mut store = MemoryStateStore::new(generate_status(&paths.plan_dir).expect("generate"));

        let err = execute_job(&mut store, &env, "core", "job_1").expect_err("no repo");
        assert!(matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::NotAGitRepository { .. })
        ));
        assert!(agent.calls().is_empty());
    }

    #[test]
    fn without_auto_commit_loop_numbers_come_from_state() {
        let mut fx = Fixture::new();
        fx.config.execution.auto_commit = false;
        let agent = ScriptedAgent::new().touching_files();
        let mut store = fx.store();

        let first = execute_job(&mut store, &fx.env(&agent), "core", "job_1").expect("one");
        let second = execute_job(&mut store, &fx.env(&agent), "core", "job_2").expect("two");

        assert_eq!((first.loop_number, second.loop_number), (1, 2));
        assert!(second.checkpoint.is_none());
        assert_eq!(fx.repo.commit_count().expect("count"), 1);
        assert_eq!(store.state().global.status, Status::Completed);
    }
}
