//! Git adapter for checkpointing.
//!
//! A small, explicit wrapper around `git` subprocess calls. The [`GitOps`]
//! trait is the seam the checkpointer is written against.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::commit_message::ChangeStats;

static INSERTIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) insertions?\(\+\)").unwrap());
static DELETIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) deletions?\(-\)").unwrap());

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';
const LOG_FORMAT: &str = "--pretty=format:%H%x1f%an%x1f%at%x1f%s%x1f%b%x1e";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One commit read from `git log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub hash: String,
    pub author: String,
    pub unix_secs: i64,
    pub subject: String,
    pub body: String,
}

/// How `git reset` treats the index and working tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResetMode {
    #[default]
    Hard,
    Soft,
    Mixed,
}

impl ResetMode {
    pub fn as_flag(self) -> &'static str {
        match self {
            ResetMode::Hard => "--hard",
            ResetMode::Soft => "--soft",
            ResetMode::Mixed => "--mixed",
        }
    }
}

impl fmt::Display for ResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetMode::Hard => "hard",
            ResetMode::Soft => "soft",
            ResetMode::Mixed => "mixed",
        })
    }
}

impl FromStr for ResetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(ResetMode::Hard),
            "soft" => Ok(ResetMode::Soft),
            "mixed" => Ok(ResetMode::Mixed),
            other => Err(format!("unknown reset mode '{other}' (hard|soft|mixed)")),
        }
    }
}

/// Git capability used by the checkpointer.
pub trait GitOps {
    fn workdir(&self) -> &Path;
    fn is_repo(&self) -> bool;
    /// Run `git init` when `workdir` is not yet a repository. Returns true if it created one.
    fn init_if_needed(&self) -> Result<bool>;
    fn has_uncommitted_changes(&self) -> Result<bool>;
    fn change_stats(&self) -> Result<ChangeStats>;
    /// Run an arbitrary git command and return its stdout.
    fn run_git(&self, args: &[&str]) -> Result<String>;
    fn add_all(&self) -> Result<()>;
    /// Commit staged changes. Returns false when nothing was staged.
    fn commit_staged(&self, message: &str) -> Result<bool>;
    fn head_hash(&self) -> Result<Option<String>>;
    /// Newest-first log entries, at most `limit`.
    fn log(&self, limit: usize) -> Result<Vec<LogEntry>>;
    /// Whether `hash` names an existing commit.
    fn commit_exists(&self, hash: &str) -> Result<bool>;
    /// Create a branch at HEAD without switching to it.
    fn create_branch(&self, name: &str) -> Result<()>;
    fn reset(&self, hash: &str, mode: ResetMode) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    fn diff_stat_lines(&self, cached: bool) -> (u32, u32) {
        let args: &[&str] = if cached {
            &["diff", "--cached", "--stat"]
        } else {
            &["diff", "--stat"]
        };
        match self.run(args) {
            Ok(out) if out.status.success() => {
                parse_stat_summary(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                debug!(stderr = %String::from_utf8_lossy(&out.stderr).trim(), "diff --stat failed");
                (0, 0)
            }
            Err(err) => {
                debug!(err = %err, "diff --stat failed");
                (0, 0)
            }
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl GitOps for Git {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    fn init_if_needed(&self) -> Result<bool> {
        if self.is_repo() {
            return Ok(false);
        }
        debug!("initializing git repository");
        self.run_checked(&["init"])?;
        Ok(true)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    #[instrument(skip_all)]
    fn change_stats(&self) -> Result<ChangeStats> {
        let mut stats = ChangeStats::default();
        for entry in self.status_porcelain()? {
            match classify_change(&entry.code) {
                Some(FileChange::Added) => stats.files_added += 1,
                Some(FileChange::Modified) => stats.files_modified += 1,
                Some(FileChange::Deleted) => stats.files_deleted += 1,
                None => {}
            }
        }
        let (staged_add, staged_del) = self.diff_stat_lines(true);
        let (work_add, work_del) = self.diff_stat_lines(false);
        stats.lines_added = staged_add + work_add;
        stats.lines_deleted = staged_del + work_del;
        debug!(?stats, "computed change stats");
        Ok(stats)
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        self.run_capture(args)
    }

    fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn head_hash(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "-q", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    #[instrument(skip_all, fields(limit))]
    fn log(&self, limit: usize) -> Result<Vec<LogEntry>> {
        if self.head_hash()?.is_none() {
            return Ok(Vec::new());
        }
        let count = format!("-n{limit}");
        let out = self.run_capture(&["log", LOG_FORMAT, &count])?;
        Ok(parse_log(&out))
    }

    fn commit_exists(&self, hash: &str) -> Result<bool> {
        if hash.trim().is_empty() || hash.starts_with('-') {
            return Ok(false);
        }
        let out = self.run(&["cat-file", "-t", hash])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "commit")
    }

    #[instrument(skip_all, fields(branch = name))]
    fn create_branch(&self, name: &str) -> Result<()> {
        if self.branch_exists(name)? {
            return Err(anyhow!("branch '{name}' already exists"));
        }
        self.run_checked(&["branch", name])?;
        Ok(())
    }

    #[instrument(skip_all, fields(hash, mode = %mode))]
    fn reset(&self, hash: &str, mode: ResetMode) -> Result<()> {
        self.run_checked(&["reset", mode.as_flag(), hash])?;
        Ok(())
    }
}

/// Default backup branch name for the current local time.
pub fn backup_branch_name() -> String {
    format!("morty/backup-{}", Local::now().format("%Y%m%d%H%M%S"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    Added,
    Modified,
    Deleted,
}

/// Classify a porcelain XY code, preferring the index column.
fn classify_change(code: &str) -> Option<FileChange> {
    if code == "??" {
        return Some(FileChange::Added);
    }
    let mut chars = code.chars();
    let x = chars.next().unwrap_or(' ');
    let y = chars.next().unwrap_or(' ');
    let c = if x != ' ' { x } else { y };
    match c {
        'A' | 'C' => Some(FileChange::Added),
        'M' | 'R' => Some(FileChange::Modified),
        'D' => Some(FileChange::Deleted),
        _ => None,
    }
}

/// Parse the `N insertions(+), M deletions(-)` summary of `git diff --stat`.
fn parse_stat_summary(out: &str) -> (u32, u32) {
    let Some(summary) = out.lines().rev().find(|line| line.contains("changed")) else {
        return (0, 0);
    };
    let grab = |re: &Regex| {
        re.captures(summary)
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0)
    };
    (grab(&INSERTIONS_RE), grab(&DELETIONS_RE))
}

fn parse_log(out: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for record in out.split(RECORD_SEP) {
        let record = record.trim_start_matches('\n');
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(5, FIELD_SEP).collect();
        if fields.len() < 4 {
            warn!(record = %record, "skipping malformed log record");
            continue;
        }
        let Ok(unix_secs) = fields[2].trim().parse() else {
            warn!(hash = fields[0], "skipping log record with bad timestamp");
            continue;
        };
        entries.push(LogEntry {
            hash: fields[0].trim().to_string(),
            author: fields[1].to_string(),
            unix_secs,
            subject: fields[3].to_string(),
            body: fields.get(4).map(|b| b.trim().to_string()).unwrap_or_default(),
        });
    }
    entries
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
