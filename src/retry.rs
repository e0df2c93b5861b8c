//! Bounded, blocking retry.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::warn;

/// Default pause between two attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long, and how often, an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Overall deadline measured from the first attempt.
    pub timeout: Duration,
    /// Pause between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Calls `f` until it succeeds or the policy's deadline passes.
///
/// After each failure the loop sleeps for `interval`, shortened so it never
/// overshoots the deadline. Once the deadline is reached the error of the
/// last attempt is returned. A timeout too large to represent as an
/// [`Instant`] means there is no deadline.
pub fn retry<T>(policy: &RetryPolicy, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut attempt = 1u32;

    loop {
        let err = match f() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let pause = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(err);
                }
                policy.interval.min(remaining)
            }
            None => policy.interval,
        };
        warn!(attempt, "retrying due to error: {:#}", err);

        thread::sleep(pause);
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(err);
        }
        attempt += 1;
    }
}
