//! Stable exit codes for morty CLI commands.

/// Command succeeded, or `doing` ran at least one job and stopped cleanly.
pub const OK: i32 = 0;
/// Invalid arguments, layout, config, state, or any other error.
pub const INVALID: i32 = 1;
/// `doing` found nothing to execute at all.
pub const NO_PENDING: i32 = 2;
/// `doing` stopped with pending jobs whose prerequisites are unmet.
pub const BLOCKED: i32 = 3;
/// A job failed (agent error, timeout, or checkpoint failure).
pub const JOB_FAILED: i32 = 4;
/// Stopped by SIGINT or SIGTERM.
pub const INTERRUPTED: i32 = 130;
