use std::time::Duration;

use tracing::info;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 128;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(600);

/// Errors that know whether another attempt could succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Wait imposed after `failures` consecutive failed attempts (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(failures - 1)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was classified as permanent; no further attempts were made.
    Rejected(E),
    Exhausted { attempts: u32, last_error: E },
    /// The pause between attempts was cut short by cancellation.
    Interrupted,
}

/// Runs `operation` until it succeeds, fails permanently, or the policy runs
/// out of attempts. `pause` performs the wait and returns false to abort.
pub fn with_backoff<T, E, F, P>(
    policy: &RetryPolicy,
    mut operation: F,
    mut pause: P,
) -> Result<T, RetryError<E>>
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Result<T, E>,
    P: FnMut(Duration) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures = 0;
    loop {
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(RetryError::Rejected(err));
        }

        failures += 1;
        if failures >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: failures,
                last_error: err,
            });
        }

        let delay = policy.delay_after(failures);
        info!("attempt {failures} failed ({err}), waiting {delay:?}");
        if !pause(delay) {
            return Err(RetryError::Interrupted);
        }
    }
}
