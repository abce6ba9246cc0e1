//! Bounded exponential backoff for idempotent external calls.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Backoff settings. Delays grow by `multiplier` per attempt, capped at
/// `max_delay_ms`; retrying stops once the next sleep would push the total
/// past `max_elapsed_ms` or `max_attempts` calls have been made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_elapsed_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_elapsed_ms: 120_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be >= 1.0");
        }
        if self.max_delay_ms < self.initial_delay_ms {
            anyhow::bail!("retry.max_delay_ms must be >= retry.initial_delay_ms");
        }
        Ok(())
    }

    /// Sleep before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Call `attempt` until it succeeds, fails permanently, or the budget runs
    /// out. Only errors for which `is_transient` returns true are retried; the
    /// last error is returned unchanged.
    pub fn run<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T>,
        is_transient: impl Fn(&anyhow::Error) -> bool,
    ) -> Result<T> {
        let start = Instant::now();
        let budget = Duration::from_millis(self.max_elapsed_ms);
        let mut retry = 0u32;
        loop {
            let err = match attempt() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_transient(&err) {
                debug!(err = %format!("{err:#}"), "permanent failure, not retrying");
                return Err(err);
            }
            if retry + 1 >= self.max_attempts {
                warn!(attempts = retry + 1, err = %format!("{err:#}"), "retry attempts exhausted");
                return Err(err);
            }
            let delay = self.delay_for(retry);
            if start.elapsed() + delay > budget {
                warn!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    err = %format!("{err:#}"),
                    "retry time budget exhausted",
                );
                return Err(err);
            }
            debug!(retry, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
            thread::sleep(delay);
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
            max_elapsed_ms: 10_000,
            max_attempts: 4,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 350,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn retries_transient_until_success() {
        let calls = Cell::new(0);
        let value = fast()
            .run(
                || {
                    calls.set(calls.get() + 1);
                    if calls.get() < 3 {
                        Err(anyhow!("dial tcp: i/o timeout"))
                    } else {
                        Ok(7)
                    }
                },
                |_| true,
            )
            .expect("eventually succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_errors_return_immediately() {
        let calls = Cell::new(0);
        let err = fast()
            .run(
                || -> Result<()> {
                    calls.set(calls.get() + 1);
                    Err(anyhow!("HTTP 401"))
                },
                |_| false,
            )
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.to_string(), "HTTP 401");
    }

    #[test]
    fn stops_after_max_attempts() {
        let calls = Cell::new(0);
        fast()
            .run(
                || -> Result<()> {
                    calls.set(calls.get() + 1);
                    Err(anyhow!("timeout"))
                },
                |_| true,
            )
            .unwrap_err();
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn stops_when_time_budget_would_be_exceeded() {
        let policy = RetryPolicy {
            initial_delay_ms: 50,
            max_delay_ms: 50,
            max_elapsed_ms: 10,
            ..fast()
        };
        let calls = Cell::new(0);
        policy
            .run(
                || -> Result<()> {
                    calls.set(calls.get() + 1);
                    Err(anyhow!("timeout"))
                },
                |_| true,
            )
            .unwrap_err();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { multiplier: 0.5, ..RetryPolicy::default() }.validate().is_err());
    }
}
