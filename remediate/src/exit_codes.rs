//! Stable exit codes for the `remediate` CLI.

use crate::core::outcome::CycleOutcome;

/// Changes applied and validated, or nothing to do.
pub const OK: i32 = 0;
/// Invalid input, configuration or an unrecovered cycle error.
pub const ERROR: i32 = 1;
/// Proposal rejected, approval timed out, or the run was cancelled.
pub const NOT_APPLIED: i32 = 2;
/// Changes applied but validation failed, or only some targets were written.
pub const DEGRADED: i32 = 3;

pub fn for_outcome(outcome: &CycleOutcome) -> i32 {
    if outcome.is_failure() {
        ERROR
    } else if outcome.is_not_applied() {
        NOT_APPLIED
    } else if outcome.is_degraded() {
        DEGRADED
    } else {
        OK
    }
}
