//! A real agent process under the loop: timeouts, forwarded signals, and
//! escalation on a second signal.

use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use morty::core::types::Status;
use morty::error::OrchestrationError;
use morty::io::agent::CliAgent;
use morty::io::cancel::Cancellation;
use morty::io::checkpoint::Checkpointer;
use morty::io::config::{AgentConfig, MortyConfig};
use morty::io::git::Git;
use morty::io::init::{InitOptions, MortyPaths, init_workspace};
use morty::io::process::ProcessExecutor;
use morty::io::registry::ProcessRegistry;
use morty::io::signals::SignalHandler;
use morty::io::state_store::{FileStateStore, StateStore};
use morty::looping::{LoopStop, RunOptions, run_loop};
use morty::step::{JobFailed, StepEnv, execute_job};
use morty::test_support::TestRepo;

fn repo_with_one_job() -> (TestRepo, MortyPaths) {
    let repo = TestRepo::new().expect("repo");
    repo.write_plan("core", &[], &[(1, "")]);
    let paths = init_workspace(repo.path(), InitOptions::default())
        .expect("init")
        .paths;
    (repo, paths)
}

/// An agent that runs `script` under `sh`, with no generated flags.
fn shell_agent(script: &str, timeout_secs: u64, grace_period_secs: u64) -> MortyConfig {
    MortyConfig {
        agent: AgentConfig {
            command: "sh".to_string(),
            env_var: String::new(),
            args: vec!["-c".to_string(), script.to_string()],
            skip_permissions: false,
            output_format: String::new(),
            timeout_secs,
            grace_period_secs,
            ..AgentConfig::default()
        },
        ..MortyConfig::default()
    }
}

fn wait_for_child(registry: &ProcessRegistry) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while registry.is_empty() {
        assert!(Instant::now() < deadline, "agent never started");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn agent_timeout_fails_job_with_partial_result() {
    let (repo, paths) = repo_with_one_job();
    let config = shell_agent("echo started; sleep 30", 1, 1);
    let agent = CliAgent::new(ProcessExecutor::default(), config.agent.clone());
    let checkpointer = Checkpointer::new(Git::new(repo.path()));
    let cancel = Cancellation::new();
    let env = StepEnv {
        paths: &paths,
        config: &config,
        agent: &agent,
        checkpointer: &checkpointer,
        cancel: &cancel,
    };
    let mut store = FileStateStore::open(&paths.status_path).expect("open");

    let err = execute_job(&mut store, &env, "core", "job_1").expect_err("timeout");

    assert!(err.downcast_ref::<JobFailed>().is_some());
    let Some(OrchestrationError::ProcessTimedOut(result)) = err.downcast_ref::<OrchestrationError>()
    else {
        panic!("expected timeout, got {err:#}");
    };
    assert!(result.timed_out && result.interrupted);
    assert_ne!(result.exit_code, 0);
    assert_eq!(result.stdout.as_deref(), Some("started\n"));

    let persisted = FileStateStore::open(&paths.status_path).expect("reopen");
    assert_eq!(persisted.job("core", "job_1").map(|j| j.status), Some(Status::Failed));
    let log = std::fs::read_to_string(paths.agent_log_path("core", "job_1", 1)).expect("log");
    assert!(log.contains("timed_out: true"));
}

#[test]
fn delivered_signal_is_forwarded_and_loop_stops_interrupted() {
    let (repo, paths) = repo_with_one_job();
    let config = shell_agent("trap 'exit 42' INT; while :; do sleep 0.1; done", 60, 5);
    let registry = ProcessRegistry::new();
    let handler = SignalHandler::new(Cancellation::new(), registry.clone());
    let agent = CliAgent::new(ProcessExecutor::new(registry.clone()), config.agent.clone());
    let checkpointer = Checkpointer::new(Git::new(repo.path()));
    let env = StepEnv {
        paths: &paths,
        config: &config,
        agent: &agent,
        checkpointer: &checkpointer,
        cancel: handler.cancellation(),
    };
    let mut store = FileStateStore::open(&paths.status_path).expect("open");

    let outcome = thread::scope(|s| {
        s.spawn(|| {
            wait_for_child(&registry);
            handler.deliver(Signal::SIGINT);
        });
        run_loop(&mut store, &env, &RunOptions::default(), |_| {})
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Interrupted);
    assert_eq!(handler.received(), Some(Signal::SIGINT));
    assert!(registry.is_empty());
    let job = store.job("core", "job_1").expect("job");
    assert_eq!(job.status, Status::Failed);
    assert!(
        job.failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("SIGINT"))
    );
}

/// The agent ignores SIGINT; the second signal kills it without waiting for
/// the grace period.
#[test]
fn second_signal_escalates_to_kill() {
    let (repo, paths) = repo_with_one_job();
    let config = shell_agent("trap '' INT; sleep 30", 120, 60);
    let registry = ProcessRegistry::new();
    let handler = SignalHandler::new(Cancellation::new(), registry.clone());
    let agent = CliAgent::new(ProcessExecutor::new(registry.clone()), config.agent.clone());
    let checkpointer = Checkpointer::new(Git::new(repo.path()));
    let env = StepEnv {
        paths: &paths,
        config: &config,
        agent: &agent,
        checkpointer: &checkpointer,
        cancel: handler.cancellation(),
    };
    let mut store = FileStateStore::open(&paths.status_path).expect("open");
    let started = Instant::now();

    let outcome = thread::scope(|s| {
        s.spawn(|| {
            wait_for_child(&registry);
            handler.deliver(Signal::SIGINT);
            thread::sleep(Duration::from_millis(300));
            handler.deliver(Signal::SIGINT);
        });
        run_loop(&mut store, &env, &RunOptions::default(), |_| {})
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Interrupted);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(store.job("core", "job_1").map(|j| j.status), Some(Status::Failed));
}
