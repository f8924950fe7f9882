//! Deterministic, pure logic shared by the workflow and its collaborators.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests and
//! for replay after a restart.

pub mod categories;
pub mod ids;
pub mod merge;
pub mod outcome;
pub mod retry;
pub mod state;
pub mod trigger;
pub mod types;
