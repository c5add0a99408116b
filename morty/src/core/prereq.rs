//! Job prerequisite classification and resolution.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ExecutionStatus, Status};

static SAME_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^job_(\d+)(?:\s*-\s*.*)?$").unwrap());
static CROSS_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+?)\s*:job_(\d+)(?:\s*-\s*.*)?$").unwrap());

/// A typed prerequisite entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    /// `job_N[ - text]` in the same module.
    SameModule { index: u32 },
    /// `module:job_N[ - text]`.
    CrossModule { module: String, index: u32 },
    /// Free text. Advisory only, never blocks.
    Descriptive(String),
}

impl Prerequisite {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(caps) = SAME_MODULE_RE.captures(trimmed)
            && let Ok(index) = caps[1].parse()
        {
            return Prerequisite::SameModule { index };
        }
        if let Some(caps) = CROSS_MODULE_RE.captures(trimmed)
            && let Ok(index) = caps[2].parse()
        {
            return Prerequisite::CrossModule {
                module: caps[1].trim().to_string(),
                index,
            };
        }
        Prerequisite::Descriptive(trimmed.to_string())
    }
}

/// Why a structural prerequisite did not resolve to a COMPLETED job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrereqIssue {
    /// The referenced job exists but is not COMPLETED.
    Incomplete {
        module: String,
        job: String,
        status: Status,
    },
    /// The referenced module or job does not exist in the plan.
    Missing { module: String, index: u32 },
}

impl fmt::Display for PrereqIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrereqIssue::Incomplete {
                module,
                job,
                status,
            } => write!(f, "{module}:{job} is {status}"),
            PrereqIssue::Missing { module, index } => {
                write!(f, "{module}:job_{index} does not exist")
            }
        }
    }
}

/// Outcome of checking one job's prerequisites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrereqCheck {
    /// Blocking issues. Empty means the job is executable.
    pub unmet: Vec<PrereqIssue>,
    /// Stale references that were tolerated.
    pub missing: Vec<PrereqIssue>,
}

impl PrereqCheck {
    pub fn is_satisfied(&self) -> bool {
        self.unmet.is_empty()
    }

    pub fn unmet_descriptions(&self) -> Vec<String> {
        self.unmet.iter().map(ToString::to_string).collect()
    }
}

/// Resolves prerequisites against an [`ExecutionStatus`].
#[derive(Debug, Clone, Copy)]
pub struct PrerequisiteResolver<'a> {
    state: &'a ExecutionStatus,
    strict: bool,
}

impl<'a> PrerequisiteResolver<'a> {
    /// Missing references are tolerated (reported but not blocking).
    pub fn new(state: &'a ExecutionStatus) -> Self {
        Self {
            state,
            strict: false,
        }
    }

    /// When strict, missing references block like incomplete ones.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Check every prerequisite of `module`/`job`.
    ///
    /// An unknown module or job yields an empty check; existence is the
    /// selector's concern.
    pub fn check(&self, module: &str, job: &str) -> PrereqCheck {
        let mut check = PrereqCheck::default();
        let Some(target) = self.state.job(module, job) else {
            return check;
        };

        for raw in &target.prerequisites {
            let (ref_module, index) = match Prerequisite::parse(raw) {
                Prerequisite::SameModule { index } => (module.to_string(), index),
                Prerequisite::CrossModule { module, index } => (module, index),
                Prerequisite::Descriptive(_) => continue,
            };
            let referenced = self
                .state
                .module(&ref_module)
                .and_then(|m| m.job_by_index(index));
            match referenced {
                Some(dep) if dep.status == Status::Completed => {}
                Some(dep) => check.unmet.push(PrereqIssue::Incomplete {
                    module: ref_module,
                    job: dep.name.clone(),
                    status: dep.status,
                }),
                None => {
                    let issue = PrereqIssue::Missing {
                        module: ref_module,
                        index,
                    };
                    if self.strict {
                        check.unmet.push(issue);
                    } else {
                        check.missing.push(issue);
                    }
                }
            }
        }
        check
    }
}
