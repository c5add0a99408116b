//! Rollback scenarios: reset to a loop checkpoint or commit creates exactly
//! one backup branch and restores the working tree according to the mode.

use std::fs;

use morty::core::types::Status;
use morty::io::cancel::Cancellation;
use morty::io::checkpoint::Checkpointer;
use morty::io::config::MortyConfig;
use morty::io::git::{Git, ResetMode};
use morty::io::init::{InitOptions, MortyPaths, init_workspace};
use morty::io::state_store::{FileStateStore, StateStore};
use morty::looping::{RunOptions, run_loop};
use morty::step::StepEnv;
use morty::test_support::{ScriptedAgent, TestRepo};

/// Run three loops over one module with three jobs.
fn repo_with_three_loops() -> (TestRepo, MortyPaths) {
    let repo = TestRepo::new().expect("repo");
    repo.write_plan("core", &[], &[(1, ""), (2, ""), (3, "")]);
    let paths = init_workspace(repo.path(), InitOptions::default())
        .expect("init")
        .paths;
    let config = MortyConfig::default();
    let checkpointer = Checkpointer::new(Git::new(repo.path()));
    let cancel = Cancellation::new();
    let agent = ScriptedAgent::new().touching_files();
    let env = StepEnv {
        paths: &paths,
        config: &config,
        agent: &agent,
        checkpointer: &checkpointer,
        cancel: &cancel,
    };
    let mut store = FileStateStore::open(&paths.status_path).expect("open");
    let outcome = run_loop(&mut store, &env, &RunOptions::default(), |_| {}).expect("loop");
    assert_eq!(outcome.steps_executed, 3);
    (repo, paths)
}

#[test]
fn hard_rollback_to_loop_restores_files_and_status() {
    let (repo, paths) = repo_with_three_loops();
    let checkpointer = Checkpointer::new(Git::new(repo.path()));
    let branches_before = repo.branches().expect("branches").len();

    let outcome = checkpointer
        .rollback_to_loop(1, ResetMode::Hard, None)
        .expect("rollback");

    assert_eq!(repo.branches().expect("branches").len(), branches_before + 1);
    assert!(outcome.backup_branch.starts_with("morty/backup-"));
    assert_eq!(repo.head_hash().expect("head"), outcome.target);
    assert!(repo.path().join("core_job_1.txt").exists());
    assert!(!repo.path().join("core_job_2.txt").exists());
    assert!(!repo.path().join("core_job_3.txt").exists());

    // The status file is part of every checkpoint, so it rolls back too.
    let store = FileStateStore::open(&paths.status_path).expect("open");
    assert_eq!(store.job("core", "job_1").map(|j| j.status), Some(Status::Completed));
    assert_eq!(store.job("core", "job_2").map(|j| j.status), Some(Status::Pending));

    // The backup branch still points at the pre-reset HEAD.
    let backup_subject = repo
        .git(&["log", "-1", "--pretty=format:%s", &outcome.backup_branch])
        .expect("backup log");
    assert_eq!(backup_subject, "morty: loop 3 - COMPLETED");
}

/// Soft reset two commits back keeps later changes staged.
#[test]
fn soft_reset_to_commit_keeps_later_changes_staged() {
    let (repo, _paths) = repo_with_three_loops();
    let checkpointer = Checkpointer::new(Git::new(repo.path()));
    let target = repo.git(&["rev-parse", "HEAD~2"]).expect("rev-parse");
    let branches_before = repo.branches().expect("branches").len();

    let outcome = checkpointer
        .reset_to_commit(&target, ResetMode::Soft, Some("before-soft-reset"))
        .expect("reset");

    assert_eq!(outcome.backup_branch, "before-soft-reset");
    assert_eq!(repo.branches().expect("branches").len(), branches_before + 1);
    assert_eq!(repo.head_hash().expect("head"), target);
    let staged = repo
        .git(&["diff", "--cached", "--name-only"])
        .expect("staged");
    assert!(staged.lines().any(|l| l == "core_job_2.txt"));
    assert!(staged.lines().any(|l| l == "core_job_3.txt"));
    assert!(repo.path().join("core_job_3.txt").exists());
}

#[test]
fn reset_keeps_untracked_agent_logs() {
    let (repo, paths) = repo_with_three_loops();
    fs::create_dir_all(&paths.logs_dir).expect("logs dir");
    let log = paths.agent_log_path("core", "job_3", 3);
    fs::write(&log, "exit_code: 0\n").expect("write log");
    let checkpointer = Checkpointer::new(Git::new(repo.path()));

    checkpointer
        .rollback_to_loop(2, ResetMode::Hard, None)
        .expect("rollback");

    assert!(log.exists());
    assert!(!repo.path().join("core_job_3.txt").exists());
}
