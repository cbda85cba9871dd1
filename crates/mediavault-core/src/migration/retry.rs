use crate::error::Result;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Longest single wait between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1` (attempts count from 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        what, attempt, max, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
