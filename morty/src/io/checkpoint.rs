//! Git checkpoints for orchestration loops: commit, history, and rollback.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::commit_message::{ChangeStats, CommitMessage, CommitSubject};
use crate::core::history::{LoopCommit, loop_commit_from_log, next_loop_number};
use crate::error::OrchestrationError;
use crate::io::git::{GitOps, ResetMode, backup_branch_name};

/// How far back `commit_at_loop` searches.
const LOOP_SEARCH_DEPTH: usize = 1000;

/// Result of a checkpoint attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// New HEAD, or `None` when there was nothing to commit.
    pub hash: Option<String>,
    pub message: String,
    pub stats: ChangeStats,
}

impl CheckpointOutcome {
    pub fn committed(&self) -> bool {
        self.hash.is_some()
    }
}

/// Result of a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub backup_branch: String,
    pub target: String,
    pub mode: ResetMode,
}

/// Commits working-tree changes with the checkpoint grammar and rolls back to them.
///
/// Operations are sequential per repository; callers must not interleave resets
/// with commits from another thread.
#[derive(Debug, Clone)]
pub struct Checkpointer<G: GitOps> {
    git: G,
}

impl<G: GitOps> Checkpointer<G> {
    pub fn new(git: G) -> Self {
        Self { git }
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    /// 1 + the highest loop number recorded in history, or 1.
    pub fn next_loop_number(&self) -> Result<u32> {
        self.ensure_repo()?;
        if self.git.head_hash()?.is_none() {
            return Ok(1);
        }
        let subjects = self.git.run_git(&["log", "--pretty=format:%s"])?;
        Ok(next_loop_number(subjects.lines()))
    }

    /// Commit everything as `morty: loop N - STATUS`.
    pub fn commit_loop(&self, loop_number: u32, status: &str) -> Result<CheckpointOutcome> {
        self.commit(CommitSubject::for_loop(loop_number, status))
    }

    /// Commit everything as `morty: module/job - STATUS[ (loop N)]`.
    pub fn commit_job(
        &self,
        module: &str,
        job: &str,
        status: &str,
        loop_number: Option<u32>,
    ) -> Result<CheckpointOutcome> {
        self.commit(CommitSubject::for_job(module, job, status, loop_number))
    }

    #[instrument(skip_all, fields(subject = %subject))]
    fn commit(&self, subject: CommitSubject) -> Result<CheckpointOutcome> {
        self.ensure_repo()?;
        if !self.git.has_uncommitted_changes()? {
            debug!("no changes to checkpoint");
            return Ok(CheckpointOutcome {
                hash: None,
                message: subject.to_string(),
                stats: ChangeStats::default(),
            });
        }

        let stats = self.git.change_stats().context("compute change stats")?;
        let message = CommitMessage {
            subject,
            stats: Some(stats),
        }
        .to_string();
        self.git.add_all().context("stage changes")?;
        if !self.git.commit_staged(&message).context("commit checkpoint")? {
            debug!("nothing staged after add, skipping commit");
            return Ok(CheckpointOutcome {
                hash: None,
                message,
                stats,
            });
        }
        let hash = self.git.head_hash()?;
        info!(hash = ?hash, files = stats.total_files(), "checkpoint committed");
        Ok(CheckpointOutcome {
            hash,
            message,
            stats,
        })
    }

    /// Up to `limit` loop commits, newest first. Unparseable commits are skipped.
    #[instrument(skip_all, fields(limit))]
    pub fn history(&self, limit: usize) -> Result<Vec<LoopCommit>> {
        self.ensure_repo()?;
        let entries = self.git.log(limit.saturating_mul(3))?;
        let history: Vec<LoopCommit> = entries
            .iter()
            .filter_map(|entry| {
                loop_commit_from_log(
                    &entry.hash,
                    &entry.author,
                    entry.unix_secs,
                    &entry.subject,
                    &entry.body,
                )
            })
            .take(limit)
            .collect();
        debug!(found = history.len(), "loaded loop history");
        Ok(history)
    }

    /// Hash of the newest commit recorded for `loop_number`.
    pub fn commit_at_loop(&self, loop_number: u32) -> Result<String> {
        self.history(LOOP_SEARCH_DEPTH)?
            .into_iter()
            .find(|commit| commit.loop_number == loop_number)
            .map(|commit| commit.hash)
            .ok_or_else(|| OrchestrationError::LoopNotFound(loop_number).into())
    }

    pub fn rollback_to_loop(
        &self,
        loop_number: u32,
        mode: ResetMode,
        backup_name: Option<&str>,
    ) -> Result<ResetOutcome> {
        let hash = self.commit_at_loop(loop_number)?;
        info!(loop_number, hash = %hash, "rolling back to loop");
        self.reset_to_commit(&hash, mode, backup_name)
    }

    /// Validate `hash`, create a backup branch at HEAD, then reset.
    #[instrument(skip_all, fields(hash, mode = %mode))]
    pub fn reset_to_commit(
        &self,
        hash: &str,
        mode: ResetMode,
        backup_name: Option<&str>,
    ) -> Result<ResetOutcome> {
        self.ensure_repo()?;
        if !self.git.commit_exists(hash)? {
            return Err(OrchestrationError::InvalidCommitHash {
                hash: hash.to_string(),
            }
            .into());
        }
        let backup_branch = self.create_backup_branch(backup_name)?;
        self.git
            .reset(hash, mode)
            .with_context(|| format!("reset {mode} to {hash}"))?;
        info!(backup = %backup_branch, "reset complete");
        Ok(ResetOutcome {
            backup_branch,
            target: hash.to_string(),
            mode,
        })
    }

    /// Create a backup branch at HEAD. Default names are timestamped and
    /// suffixed if one already exists for the same second.
    pub fn create_backup_branch(&self, name: Option<&str>) -> Result<String> {
        self.ensure_repo()?;
        if let Some(name) = name {
            self.git
                .create_branch(name)
                .with_context(|| format!("create backup branch {name}"))?;
            return Ok(name.to_string());
        }
        let base = backup_branch_name();
        let mut candidate = base.clone();
        for attempt in 1..=100 {
            match self.git.create_branch(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) => {
                    warn!(branch = %candidate, err = %err, "backup branch name taken");
                    candidate = format!("{base}-{attempt}");
                }
            }
        }
        self.git
            .create_branch(&candidate)
            .with_context(|| format!("create backup branch {candidate}"))?;
        Ok(candidate)
    }

    fn ensure_repo(&self) -> Result<()> {
        if self.git.is_repo() {
            return Ok(());
        }
        Err(OrchestrationError::NotAGitRepository {
            path: self.git.workdir().to_path_buf(),
        }
        .into())
    }
}
