//! Loop history projection over checkpoint commits.

use chrono::{DateTime, Utc};

use crate::core::commit_message::{ChangeStats, CommitSubject};

/// One orchestration loop joined to the commit it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopCommit {
    pub hash: String,
    pub loop_number: u32,
    pub status: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub subject: CommitSubject,
    pub stats: Option<ChangeStats>,
}

impl LoopCommit {
    pub fn short_hash(&self) -> &str {
        self.hash.get(..7).unwrap_or(&self.hash)
    }
}

/// Build a [`LoopCommit`] from raw log fields. Non-loop commits yield `None`.
pub fn loop_commit_from_log(
    hash: &str,
    author: &str,
    unix_secs: i64,
    subject: &str,
    body: &str,
) -> Option<LoopCommit> {
    let parsed = CommitSubject::parse(subject)?;
    let loop_number = parsed.loop_number()?;
    let timestamp = DateTime::<Utc>::from_timestamp(unix_secs, 0)?;
    Some(LoopCommit {
        hash: hash.to_string(),
        loop_number,
        status: parsed.status().to_string(),
        author: author.to_string(),
        timestamp,
        stats: ChangeStats::parse_block(body),
        subject: parsed,
    })
}

/// Highest loop number in a set of subjects, plus one. Starts at 1.
pub fn next_loop_number<'a>(subjects: impl IntoIterator<Item = &'a str>) -> u32 {
    subjects
        .into_iter()
        .filter_map(CommitSubject::parse)
        .filter_map(|subject| match subject {
            CommitSubject::Job { .. } => None,
            other => other.loop_number(),
        })
        .max()
        .map_or(1, |n| n + 1)
}

/// Fixed-width LOOP / STATUS / HASH / TIME / AUTHOR table.
pub fn format_history(history: &[LoopCommit]) -> String {
    if history.is_empty() {
        return "No loop history found.".to_string();
    }
    let rule = "-".repeat(60);
    let mut out = String::new();
    out.push_str("Loop History:\n");
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!(
        "{:<6} {:<12} {:<8} {:<20} {}\n",
        "LOOP", "STATUS", "HASH", "TIME", "AUTHOR"
    ));
    out.push_str(&rule);
    out.push('\n');
    for commit in history {
        out.push_str(&format!(
            "{:<6} {:<12} {:<8} {:<20} {}\n",
            commit.loop_number,
            commit.status,
            commit.short_hash(),
            commit.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            commit.author
        ));
    }
    out.push_str(&rule);
    out
}

/// Multi-line listing including change statistics when recorded.
pub fn format_history_detailed(history: &[LoopCommit]) -> String {
    if history.is_empty() {
        return "No loop history found.".to_string();
    }
    let rule = "=".repeat(70);
    let mut out = format!("Detailed Loop History:\n{rule}\n\n");
    for (i, commit) in history.iter().enumerate() {
        out.push_str(&format!(
            "[{}] Loop {} - {}\n",
            i + 1,
            commit.loop_number,
            commit.status
        ));
        out.push_str(&format!("    Hash:    {}\n", commit.hash));
        out.push_str(&format!("    Author:  {}\n", commit.author));
        out.push_str(&format!(
            "    Time:    {}\n",
            commit.timestamp.format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(stats) = &commit.stats {
            out.push_str(&format!(
                "    Changes: +{}/-{} lines, {}/{}/{} files (A/M/D)\n",
                stats.lines_added,
                stats.lines_deleted,
                stats.files_added,
                stats.files_modified,
                stats.files_deleted
            ));
        }
        if i + 1 < history.len() {
            out.push('\n');
        }
    }
    out.push_str(&rule);
    out
}
