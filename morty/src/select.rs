//! Selection and reporting helpers for `morty status` and `morty doing`.

use std::fmt::Write as _;

use anyhow::Result;

use crate::core::selector::{BlockedJob, JobSelector, SelectOutcome, Target};
use crate::core::types::ExecutionStatus;

/// What auto-selection would run next, without running it.
pub fn preview_next(state: &ExecutionStatus, strict: bool) -> Result<SelectOutcome> {
    Ok(JobSelector::new(state).strict(strict).select(&Target::Auto)?)
}

/// One line per module: `name [STATUS] job_1=COMPLETED job_2=PENDING`,
/// followed by a totals line.
pub fn format_status(state: &ExecutionStatus) -> String {
    let mut out = String::new();
    for module in &state.modules {
        let _ = write!(out, "{} [{}]", module.name, module.status);
        for job in &module.jobs {
            let _ = write!(out, " {}={}", job.name, job.status);
            if job.retry_count > 0 {
                let _ = write!(out, "(retries {})", job.retry_count);
            }
        }
        out.push('\n');
    }
    let counts = state.job_counts();
    let _ = writeln!(
        out,
        "global: {}  completed {}/{}  failed {}  pending {}",
        state.global.status,
        counts.completed,
        counts.total(),
        counts.failed,
        counts.pending
    );
    out
}

/// Human-readable reasons for each blocked job.
pub fn format_blocked(blocked: &[BlockedJob]) -> String {
    let mut out = String::new();
    for job in blocked {
        let _ = writeln!(out, "{}/{}: {}", job.module, job.job, job.reasons.join("; "));
    }
    out
}
