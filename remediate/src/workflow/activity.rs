//! Bounded-retry wrapper every pipeline stage runs through.

use std::future::Future;

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::retry::RetryPolicy;
use crate::workflow::error::{ActivityFailed, Cancelled, is_cancelled, is_input_error};
use crate::workflow::substrate::{Substrate, Wake};

/// Run `op` under `policy`.
///
/// Each attempt is bounded by `policy.attempt_timeout`; a timed out attempt
/// counts as failed. Input errors and cancellations are returned as-is without
/// retrying. Backoff between attempts goes through the substrate timer, so a
/// cancellation request ends the activity with [`Cancelled`]. The wrapper
/// performs no side effect of its own: `op` receives the 1-based attempt number
/// and is responsible for being safe to re-invoke.
pub async fn run_activity<S, T, F, Fut>(
    substrate: &S,
    name: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    S: Substrate + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        debug!(activity = name, attempt, max_attempts, "activity attempt");
        let result = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "attempt timed out after {}s",
                policy.attempt_timeout.as_secs_f64()
            )),
        };
        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    info!(activity = name, attempt, "activity succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if is_input_error(&err) {
            warn!(activity = name, err = %format!("{err:#}"), "input error; not retrying");
            return Err(err.context(format!("activity '{name}'")));
        }
        if is_cancelled(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(activity = name, attempts = attempt, err = %format!("{err:#}"), "activity failed");
            return Err(ActivityFailed {
                name: name.to_string(),
                attempts: attempt,
                last_error: format!("{err:#}"),
            }
            .into());
        }

        let delay = policy.backoff_for(attempt);
        warn!(
            activity = name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            err = %format!("{err:#}"),
            "activity attempt failed; retrying"
        );
        if substrate.sleep(delay).await == Wake::Cancelled {
            return Err(Cancelled::during(format!("retry backoff of '{name}'")).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::io::substrate::LocalSubstrate;
    use crate::workflow::error::InputError;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        }
    }

    /// An always-failing collaborator is attempted exactly `max_attempts` times.
    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_is_respected() {
        let substrate = LocalSubstrate::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = run_activity(&substrate, "analyze", &policy(), |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!("service unavailable"))
            }
        })
        .await
        .expect_err("exhausted");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let failed = err.downcast_ref::<ActivityFailed>().expect("activity failed");
        assert_eq!(failed.attempts, 3);
        assert!(failed.last_error.contains("service unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success() {
        let substrate = LocalSubstrate::in_memory();
        let value = run_activity(&substrate, "propose", &policy(), |attempt| async move {
            if attempt < 2 {
                Err(anyhow!("flaky"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("second attempt succeeds");
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn input_errors_are_not_retried() {
        let substrate = LocalSubstrate::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = run_activity(&substrate, "analyze", &policy(), |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(InputError::new("cannot read src/a.ts").into())
            }
        })
        .await
        .expect_err("input error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(is_input_error(&err));
    }

    /// A hanging attempt is cut off by the per-attempt timeout and counted.
    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_failure() {
        let substrate = LocalSubstrate::in_memory();
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let err = run_activity(&substrate, "validate", &policy, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .expect_err("timed out");
        let failed = err.downcast_ref::<ActivityFailed>().expect("activity failed");
        assert_eq!(failed.attempts, 2);
        assert!(failed.last_error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let substrate = LocalSubstrate::in_memory();
        substrate.cancel();
        let err = run_activity(&substrate, "apply", &policy(), |_| async {
            Err::<(), _>(anyhow!("disk full"))
        })
        .await
        .expect_err("cancelled");
        assert!(is_cancelled(&err));
    }
}
