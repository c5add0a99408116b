//! `morty` command-line entry point.
//!
//! Plans live under `.morty/plan/`, execution state in `.morty/status.json`.
//! `morty doing` runs the next executable job (or a chosen one) through the
//! agent CLI and checkpoints each loop in git.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;

use morty::core::history::{format_history, format_history_detailed};
use morty::core::selector::{SelectOutcome, Target};
use morty::error::OrchestrationError;
use morty::exit_codes;
use morty::io::agent::CliAgent;
use morty::io::cancel::Cancellation;
use morty::io::checkpoint::Checkpointer;
use morty::io::config::{MortyConfig, load_config};
use morty::io::git::{Git, ResetMode};
use morty::io::init::{InitOptions, MortyPaths, init_workspace, open_or_generate_status};
use morty::io::process::ProcessExecutor;
use morty::io::registry::ProcessRegistry;
use morty::io::signals::SignalHandler;
use morty::io::state_store::{FileStateStore, StateStore, generate_status};
use morty::logging;
use morty::looping::{LoopOutcome, LoopStop, RunOptions, run_loop};
use morty::select::{format_blocked, format_status, preview_next};
use morty::step::StepEnv;

#[derive(Parser)]
#[command(
    name = "morty",
    version,
    about = "Dependency-aware job orchestration for coding agents"
)]
struct Cli {
    /// Project root. Defaults to the current directory.
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write default config and generate the status file from the plans.
    Init {
        /// Regenerate the status file if it exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the next executable job, or keep going until none is left.
    Doing {
        /// Restrict selection to one module.
        #[arg(short, long)]
        module: Option<String>,
        /// Run one job of `--module` (`job_N`).
        #[arg(short, long)]
        job: Option<String>,
        /// Reset the selected scope to PENDING first.
        #[arg(short, long)]
        restart: bool,
    },
    /// Print module and job statuses.
    Status,
    /// Print the loop checkpoint history.
    History {
        /// Number of loops to show.
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// Include change statistics.
        #[arg(long)]
        stat: bool,
    },
    /// Reset the repository to a loop checkpoint or commit.
    Reset {
        /// Loop number to return to.
        #[arg(
            short,
            long = "loop",
            value_name = "N",
            conflicts_with = "commit",
            required_unless_present = "commit"
        )]
        loop_number: Option<u32>,
        /// Commit hash to return to.
        #[arg(short, long, value_name = "HASH")]
        commit: Option<String>,
        #[arg(long, default_value = "hard", value_name = "hard|soft|mixed")]
        mode: ResetMode,
        /// Backup branch name. Defaults to a timestamped name.
        #[arg(short, long, value_name = "NAME")]
        backup: Option<String>,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("morty: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config = load_config(&MortyPaths::new(&root).config_path)?;
    logging::init(&config.logging.level);
    debug!(root = %root.display(), "morty starting");

    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Doing {
            module,
            job,
            restart,
        } => cmd_doing(&root, &config, Target::from_parts(module, job)?, restart),
        Command::Status => cmd_status(&root, &config),
        Command::History { count, stat } => cmd_history(&root, count, stat),
        Command::Reset {
            loop_number,
            commit,
            mode,
            backup,
        } => cmd_reset(&root, loop_number, commit, mode, backup.as_deref()),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let report = init_workspace(root, InitOptions { force })?;
    println!(
        "initialized {} ({} modules, {} jobs)",
        report.paths.status_path.display(),
        report.modules,
        report.jobs
    );
    if report.created_repo {
        println!("created git repository in {}", root.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_doing(root: &Path, config: &MortyConfig, target: Target, restart: bool) -> Result<i32> {
    // Mask signals before any thread is spawned so every thread inherits it.
    let registry = ProcessRegistry::new();
    let signals = SignalHandler::install(Cancellation::new(), registry.clone())?;

    let paths = MortyPaths::with_config(root, config);
    let mut store = open_or_generate_status(&paths)?;
    let agent = CliAgent::new(ProcessExecutor::new(registry), config.agent.clone());
    let checkpointer = Checkpointer::new(Git::new(root));
    let env = StepEnv {
        paths: &paths,
        config,
        agent: &agent,
        checkpointer: &checkpointer,
        cancel: signals.cancellation(),
    };

    let outcome = run_loop(&mut store, &env, &RunOptions { target, restart }, |step| {
        let commit = match &step.checkpoint {
            Some(checkpoint) => checkpoint
                .hash
                .as_deref()
                .map_or("no changes".to_string(), |h| h.chars().take(7).collect()),
            None => "not committed".to_string(),
        };
        println!(
            "loop {}: {}/{} COMPLETED ({commit})",
            step.loop_number, step.module, step.job
        );
    });
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if signals.cancellation().is_cancelled() {
                eprintln!("morty: interrupted: {err:#}");
                return Ok(exit_codes::INTERRUPTED);
            }
            if let Some(OrchestrationError::PrerequisiteUnmet { .. }) =
                err.downcast_ref::<OrchestrationError>()
            {
                eprintln!("morty: {err:#}");
                return Ok(exit_codes::BLOCKED);
            }
            return Err(err);
        }
    };
    Ok(report_loop(&outcome))
}

fn report_loop(outcome: &LoopOutcome) -> i32 {
    for skipped in &outcome.skipped_failures {
        eprintln!("skipped {}/{}: {}", skipped.module, skipped.job, skipped.error);
    }
    let failed_any = !outcome.skipped_failures.is_empty();
    match &outcome.stop {
        LoopStop::NoPendingJobs if outcome.steps_executed == 0 && !failed_any => {
            println!("no pending jobs");
            exit_codes::NO_PENDING
        }
        LoopStop::NoPendingJobs | LoopStop::SingleJobDone => {
            println!("{} job(s) completed", outcome.steps_executed);
            if failed_any {
                exit_codes::JOB_FAILED
            } else {
                exit_codes::OK
            }
        }
        LoopStop::Blocked { pending } => {
            println!(
                "{} job(s) completed; remaining jobs are blocked:",
                outcome.steps_executed
            );
            print!("{}", format_blocked(pending));
            if failed_any {
                exit_codes::JOB_FAILED
            } else {
                exit_codes::BLOCKED
            }
        }
        LoopStop::Failed { module, job, error } => {
            eprintln!("morty: {module}/{job} failed: {error}");
            exit_codes::JOB_FAILED
        }
        LoopStop::Interrupted => {
            eprintln!("morty: interrupted");
            exit_codes::INTERRUPTED
        }
    }
}

fn cmd_status(root: &Path, config: &MortyConfig) -> Result<i32> {
    let paths = MortyPaths::with_config(root, config);
    // Read-only: a missing status file is derived from the plans but not written.
    let store = if paths.status_path.exists() {
        FileStateStore::open(&paths.status_path)?
    } else {
        FileStateStore::new(&paths.status_path, generate_status(&paths.plan_dir)?)
    };
    print!("{}", format_status(store.state()));
    match preview_next(store.state(), config.execution.strict_prerequisites)? {
        SelectOutcome::Selected(next) => println!("next: {}/{}", next.module, next.job),
        SelectOutcome::NoExecutableJob { blocked } if blocked.is_empty() => {
            println!("next: none");
        }
        SelectOutcome::NoExecutableJob { blocked } => {
            println!("next: none (blocked)");
            print!("{}", format_blocked(&blocked));
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_history(root: &Path, count: usize, stat: bool) -> Result<i32> {
    let history = Checkpointer::new(Git::new(root)).history(count)?;
    let table = if stat {
        format_history_detailed(&history)
    } else {
        format_history(&history)
    };
    println!("{}", table.trim_end());
    Ok(exit_codes::OK)
}

fn cmd_reset(
    root: &Path,
    loop_number: Option<u32>,
    commit: Option<String>,
    mode: ResetMode,
    backup: Option<&str>,
) -> Result<i32> {
    let checkpointer = Checkpointer::new(Git::new(root));
    let outcome = match (loop_number, commit) {
        (Some(n), _) => checkpointer.rollback_to_loop(n, mode, backup)?,
        (None, Some(hash)) => checkpointer.reset_to_commit(&hash, mode, backup)?,
        (None, None) => bail!("reset needs --loop or --commit"),
    };
    println!("backup branch: {}", outcome.backup_branch);
    println!("reset ({}) to {}", outcome.mode, outcome.target);
    Ok(exit_codes::OK)
}
