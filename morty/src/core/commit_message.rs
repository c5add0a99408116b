//! Checkpoint commit message grammar.
//!
//! Subjects (case-insensitive on parse, canonical on write):
//!
//! ```text
//! morty: loop <N> - <STATUS>
//! morty: <module>/<job> - <STATUS>[ (loop <N>)]
//! morty: loop <N> - <module>/<job> - <STATUS>      (legacy, parse only)
//! morty: loop <N>                                  (bare, status UNKNOWN)
//! ```
//!
//! The body, when present, is a blank line followed by a `Change Statistics:` block.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

pub const COMMIT_PREFIX: &str = "morty";
pub const UNKNOWN_STATUS: &str = "UNKNOWN";

static LEGACY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^morty:\s*loop\s+(\d+)\s*-\s*([\w.\-\[\]]+)/([\w.\-]+)\s*-\s*(\w+)").unwrap()
});
static JOB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^morty:\s*([\w.\-\[\]]+)/([\w.\-]+)\s*-\s*(\w+)(?:\s*\(loop\s+(\d+)\))?").unwrap()
});
static LOOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^morty:\s*loop\s+(\d+)\s*-\s*(\w+)").unwrap());
static BARE_LOOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^morty:\s*loop\s+(\d+)").unwrap());
static STAT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*(Files added|Files modified|Files deleted|Lines added|Lines deleted):\s*(\d+)\s*$").unwrap());

/// Parsed or to-be-written commit subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitSubject {
    Loop {
        loop_number: u32,
        status: String,
    },
    Job {
        module: String,
        job: String,
        status: String,
        loop_number: Option<u32>,
    },
    /// Older subjects that embed the job inside a loop subject.
    LegacyExtended {
        loop_number: u32,
        module: String,
        job: String,
        status: String,
    },
}

impl CommitSubject {
    pub fn for_loop(loop_number: u32, status: impl AsRef<str>) -> Self {
        CommitSubject::Loop {
            loop_number,
            status: normalize_status(status.as_ref()),
        }
    }

    pub fn for_job(
        module: impl Into<String>,
        job: impl Into<String>,
        status: impl AsRef<str>,
        loop_number: Option<u32>,
    ) -> Self {
        CommitSubject::Job {
            module: module.into(),
            job: job.into(),
            status: normalize_status(status.as_ref()),
            loop_number,
        }
    }

    /// Parse the first line of a commit message. Returns `None` for non-morty subjects.
    pub fn parse(subject: &str) -> Option<Self> {
        let line = subject.lines().next().unwrap_or_default().trim();
        if let Some(caps) = LEGACY_RE.captures(line) {
            return Some(CommitSubject::LegacyExtended {
                loop_number: caps[1].parse().ok()?,
                module: caps[2].to_string(),
                job: caps[3].to_string(),
                status: normalize_status(&caps[4]),
            });
        }
        if let Some(caps) = LOOP_RE.captures(line) {
            return Some(CommitSubject::Loop {
                loop_number: caps[1].parse().ok()?,
                status: normalize_status(&caps[2]),
            });
        }
        if let Some(caps) = JOB_RE.captures(line) {
            let loop_number = match caps.get(4) {
                Some(m) => Some(m.as_str().parse().ok()?),
                None => None,
            };
            return Some(CommitSubject::Job {
                module: caps[1].to_string(),
                job: caps[2].to_string(),
                status: normalize_status(&caps[3]),
                loop_number,
            });
        }
        if let Some(caps) = BARE_LOOP_RE.captures(line) {
            return Some(CommitSubject::Loop {
                loop_number: caps[1].parse().ok()?,
                status: UNKNOWN_STATUS.to_string(),
            });
        }
        None
    }

    pub fn loop_number(&self) -> Option<u32> {
        match self {
            CommitSubject::Loop { loop_number, .. }
            | CommitSubject::LegacyExtended { loop_number, .. } => Some(*loop_number),
            CommitSubject::Job { loop_number, .. } => *loop_number,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            CommitSubject::Loop { status, .. }
            | CommitSubject::Job { status, .. }
            | CommitSubject::LegacyExtended { status, .. } => status,
        }
    }
}

impl fmt::Display for CommitSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitSubject::Loop {
                loop_number,
                status,
            } => write!(f, "{COMMIT_PREFIX}: loop {loop_number} - {status}"),
            CommitSubject::Job {
                module,
                job,
                status,
                loop_number,
            } => {
                write!(f, "{COMMIT_PREFIX}: {module}/{job} - {status}")?;
                if let Some(n) = loop_number {
                    write!(f, " (loop {n})")?;
                }
                Ok(())
            }
            CommitSubject::LegacyExtended {
                loop_number,
                module,
                job,
                status,
            } => write!(
                f,
                "{COMMIT_PREFIX}: loop {loop_number} - {module}/{job} - {status}"
            ),
        }
    }
}

fn normalize_status(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// File and line deltas for one working-tree change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeStats {
    pub files_added: u32,
    pub files_modified: u32,
    pub files_deleted: u32,
    pub lines_added: u32,
    pub lines_deleted: u32,
}

impl ChangeStats {
    pub fn total_files(&self) -> u32 {
        self.files_added + self.files_modified + self.files_deleted
    }

    /// Render the `Change Statistics:` block (no trailing newline).
    pub fn render_block(&self) -> String {
        format!(
            "Change Statistics:\n\
             - Files added: {}\n\
             - Files modified: {}\n\
             - Files deleted: {}\n\
             - Lines added: {}\n\
             - Lines deleted: {}",
            self.files_added,
            self.files_modified,
            self.files_deleted,
            self.lines_added,
            self.lines_deleted
        )
    }

    /// Parse a `Change Statistics:` block out of a commit body.
    pub fn parse_block(body: &str) -> Option<Self> {
        let mut lines = body.lines().map(str::trim);
        lines.by_ref().find(|line| *line == "Change Statistics:")?;
        let mut stats = ChangeStats::default();
        let mut seen = 0;
        for line in lines {
            let Some(caps) = STAT_LINE_RE.captures(line) else {
                break;
            };
            let value: u32 = caps[2].parse().ok()?;
            match &caps[1] {
                "Files added" => stats.files_added = value,
                "Files modified" => stats.files_modified = value,
                "Files deleted" => stats.files_deleted = value,
                "Lines added" => stats.lines_added = value,
                _ => stats.lines_deleted = value,
            }
            seen += 1;
        }
        (seen > 0).then_some(stats)
    }
}

/// A full checkpoint commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub subject: CommitSubject,
    pub stats: Option<ChangeStats>,
}

impl fmt::Display for CommitMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subject)?;
        if let Some(stats) = &self.stats {
            write!(f, "\n\n{}", stats.render_block())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_subject_round_trips() {
        for (n, status) in [(1, "COMPLETED"), (5, "FAILED"), (42, "Blocked7"), (9999, "x")] {
            let subject = CommitSubject::for_loop(n, status);
            let parsed = CommitSubject::parse(&subject.to_string()).expect("parse");
            assert_eq!(parsed.loop_number(), Some(n));
            assert_eq!(parsed.status(), status.to_ascii_uppercase());
        }
    }

    #[test]
    fn writes_exact_grammar() {
        assert_eq!(
            CommitSubject::for_loop(5, "completed").to_string(),
            "morty: loop 5 - COMPLETED"
        );
        assert_eq!(
            CommitSubject::for_job("storage", "job_2", "COMPLETED", Some(7)).to_string(),
            "morty: storage/job_2 - COMPLETED (loop 7)"
        );
        assert_eq!(
            CommitSubject::for_job("storage", "job_2", "FAILED", None).to_string(),
            "morty: storage/job_2 - FAILED"
        );
    }

    #[test]
    fn parses_job_variant_with_and_without_loop() {
        assert_eq!(
            CommitSubject::parse("morty: storage/job_2 - completed (loop 7)"),
            Some(CommitSubject::Job {
                module: "storage".to_string(),
                job: "job_2".to_string(),
                status: "COMPLETED".to_string(),
                loop_number: Some(7),
            })
        );
        let plain = CommitSubject::parse("morty: storage/job_2 - FAILED").expect("parse");
        assert_eq!(plain.loop_number(), None);
    }

    #[test]
    fn parses_legacy_extended_form() {
        assert_eq!(
            CommitSubject::parse("MORTY: Loop 3 - api/job_1 - COMPLETED"),
            Some(CommitSubject::LegacyExtended {
                loop_number: 3,
                module: "api".to_string(),
                job: "job_1".to_string(),
                status: "COMPLETED".to_string(),
            })
        );
    }

    #[test]
    fn bare_loop_has_unknown_status() {
        let parsed = CommitSubject::parse("morty: loop 12").expect("parse");
        assert_eq!(parsed.loop_number(), Some(12));
        assert_eq!(parsed.status(), UNKNOWN_STATUS);
    }

    #[test]
    fn ignores_foreign_subjects() {
        assert_eq!(CommitSubject::parse("fix: typo"), None);
        assert_eq!(CommitSubject::parse("Initial commit"), None);
        assert_eq!(CommitSubject::parse(""), None);
    }

    #[test]
    fn message_body_carries_statistics_block() {
        let message = CommitMessage {
            subject: CommitSubject::for_loop(2, "COMPLETED"),
            stats: Some(ChangeStats {
                files_added: 1,
                files_modified: 2,
                files_deleted: 3,
                lines_added: 40,
                lines_deleted: 5,
            }),
        };
        let rendered = message.to_string();
        assert_eq!(
            rendered,
            "morty: loop 2 - COMPLETED\n\nChange Statistics:\n- Files added: 1\n- Files modified: 2\n- Files deleted: 3\n- Lines added: 40\n- Lines deleted: 5"
        );
        assert_eq!(ChangeStats::parse_block(&rendered), message.stats);
        assert_eq!(ChangeStats::parse_block("no stats here"), None);
    }
}
