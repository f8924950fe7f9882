//! Typed errors the workflow loop branches on.
//!
//! Collaborators return `anyhow::Error`; the loop recovers these markers with
//! `downcast_ref` to decide between retrying, recovering and terminating.

use thiserror::Error;

/// Malformed configuration or unreadable subject. Never retried.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct InputError {
    pub message: String,
}

impl InputError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An activity exhausted its attempt budget.
#[derive(Debug, Error)]
#[error("activity '{name}' failed after {attempts} attempt(s): {last_error}")]
pub struct ActivityFailed {
    pub name: String,
    pub attempts: u32,
    /// Rendered chain of the final attempt's error.
    pub last_error: String,
}

/// Cancellation was observed at a suspension point.
#[derive(Debug, Error)]
#[error("workflow cancelled during {during}")]
pub struct Cancelled {
    pub during: String,
}

impl Cancelled {
    pub fn during(what: impl Into<String>) -> Self {
        Self {
            during: what.into(),
        }
    }
}

/// Whether `err` (or anything it wraps) is an [`InputError`].
pub fn is_input_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<InputError>())
}

/// Whether `err` (or anything it wraps) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn input_errors_are_found_through_context() {
        let err = Err::<(), _>(anyhow::Error::new(InputError::new("cannot read a.ts")))
            .context("analyze")
            .expect_err("error");
        assert!(is_input_error(&err));
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn activity_failure_names_activity_and_attempts() {
        let err = anyhow::Error::new(ActivityFailed {
            name: "analyze".to_string(),
            attempts: 3,
            last_error: "connection refused".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "activity 'analyze' failed after 3 attempt(s): connection refused"
        );
        assert!(!is_input_error(&err));
    }
}
