//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod commit_message;
pub mod graph;
pub mod history;
pub mod prereq;
pub mod selector;
pub mod transitions;
pub mod types;
