//! Typed orchestration failures.
//!
//! Call sites wrap these in `anyhow::Error`; callers that need to branch on the
//! kind recover it with `err.downcast_ref::<OrchestrationError>()`.

use std::path::PathBuf;

use crate::core::types::Status;
use crate::io::process::{ProcessError, ProcessResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    /// Nothing left to schedule. Terminal, not fatal.
    #[error("no pending jobs")]
    NoPendingJobs,

    #[error("prerequisites unmet for {module}/{job}: {}", unmet.join(", "))]
    PrerequisiteUnmet {
        module: String,
        job: String,
        unmet: Vec<String>,
    },

    #[error("circular dependency among modules: {}", modules.join(", "))]
    CircularDependency { modules: Vec<String> },

    #[error("invalid commit hash '{hash}'")]
    InvalidCommitHash { hash: String },

    #[error("not a git repository: {}", path.display())]
    NotAGitRepository { path: PathBuf },

    #[error("agent timed out after {:?}", .0.duration)]
    ProcessTimedOut(ProcessResult),

    #[error("agent killed (exit {})", .0.exit_code)]
    ProcessKilled(ProcessResult),

    #[error("agent interrupted (exit {})", .0.exit_code)]
    ProcessInterrupted(ProcessResult),

    /// The job ran successfully but its checkpoint commit did not land.
    #[error("job {module}/{job} completed but was not checkpointed: {reason}")]
    CommitFailed {
        module: String,
        job: String,
        reason: String,
    },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("job {module}/{job} reached its retry limit ({retries}/{max})")]
    RetryLimitExceeded {
        module: String,
        job: String,
        retries: u32,
        max: u32,
    },

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("unknown job '{job}' in module '{module}'")]
    UnknownJob { module: String, job: String },

    #[error("invalid transition for {module}/{job}: {from} -> {to}")]
    InvalidTransition {
        module: String,
        job: String,
        from: Status,
        to: Status,
    },

    #[error("no commit found for loop {0}")]
    LoopNotFound(u32),
}

impl OrchestrationError {
    /// The typed counterpart of a process failure, when one exists.
    ///
    /// Spawn failures and wait errors carry no lifecycle meaning and stay as
    /// [`ProcessError`].
    pub fn from_process(err: &ProcessError) -> Option<Self> {
        match err {
            ProcessError::TimedOut(result) => Some(Self::ProcessTimedOut(result.clone())),
            ProcessError::Killed(result) => Some(Self::ProcessKilled(result.clone())),
            ProcessError::Interrupted(result) => Some(Self::ProcessInterrupted(result.clone())),
            ProcessError::Cancelled | ProcessError::Spawn { .. } | ProcessError::Errored { .. } => {
                None
            }
        }
    }

    /// The partial process record for lifecycle failures.
    pub fn process_result(&self) -> Option<&ProcessResult> {
        match self {
            Self::ProcessTimedOut(result)
            | Self::ProcessKilled(result)
            | Self::ProcessInterrupted(result) => Some(result),
            _ => None,
        }
    }
}
