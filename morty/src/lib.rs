//! Dependency-aware job orchestration for coding agents.
//!
//! Plans under `.morty/plan/` describe modules of numbered jobs. The crate
//! orders modules by dependency, picks the next executable job, runs the agent
//! CLI on it under a supervised process, and checkpoints each loop in git.
//!
//! - **[`core`]**: Pure, deterministic logic (graph, prerequisites, selection,
//!   transitions, commit grammar). No I/O.
//! - **[`io`]**: Side effects (plans, state file, git, processes, signals).
//!   Traits at the seams let tests substitute doubles.
//!
//! [`step`] runs one job and [`looping`] drives steps; [`select`] renders
//! state for the CLI.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
