//! Approval-gated remediation workflow.
//!
//! A long-lived loop that analyzes a subject (a source file, or a repository's
//! tooling configuration), proposes a change, waits for approval, applies the
//! change and validates it. The loop survives restarts: every stage transition
//! is checkpointed and resumed from durable state.
//!
//! - **[`core`]**: Pure, deterministic types and state machine. No I/O.
//! - **[`workflow`]**: The orchestration (activity wrapper, approval gate,
//!   pipeline, scheduler), written against the [`workflow::substrate::Substrate`]
//!   and collaborator traits.
//! - **[`io`]**: Side-effecting adapters (file-backed substrate, signal inbox,
//!   cycle journal, agent process, lint/type-check commands, filesystem apply).

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
