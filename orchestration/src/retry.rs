//! Retry policy: exponential backoff for transient stage failures.
//!
//! Attempts are 1-based. When attempt `n` fails transiently and fewer than
//! `max_retries` retries have been used, the next attempt is scheduled
//! after `base_delay * multiplier^(n-1)`, capped at `max_delay`:
//!
//! ```text
//! max_retries = 3, base = 1s
//! attempt 1 fails → retry in 1s
//! attempt 2 fails → retry in 2s
//! attempt 3 fails → retry in 4s
//! attempt 4 fails → exhausted
//! ```
//!
//! Circuit-open failures do not consume an attempt. They wait out the
//! breaker, bounded by `max_circuit_waits`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff multiplier (2.0 for doubling).
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Consecutive circuit-open waits tolerated before giving up.
    pub max_circuit_waits: u32,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the stage as `next_attempt` once `delay` has elapsed.
    Retry { next_attempt: u32, delay: Duration },
    /// Budget spent; hand over to the escalation policy.
    Exhausted { attempts: u32 },
    /// The failure kind is never retried.
    NotRetriable { kind: FailureKind },
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based). Retry 0 has no delay.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }

    /// Whether another retry is allowed after `retries_used` retries.
    pub fn should_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }

    /// Decide after attempt `failed_attempt` (1-based) failed with `kind`.
    pub fn on_failure(&self, failed_attempt: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_retriable() {
            return RetryDecision::NotRetriable { kind };
        }

        let retries_used = failed_attempt.saturating_sub(1);
        if self.should_retry(retries_used) {
            RetryDecision::Retry {
                next_attempt: failed_attempt + 1,
                delay: self.backoff_duration(failed_attempt),
            }
        } else {
            RetryDecision::Exhausted {
                attempts: failed_attempt,
            }
        }
    }

    /// Decide after a call was rejected by an open breaker.
    ///
    /// The attempt is not consumed: `next_attempt` repeats `attempt`.
    pub fn on_circuit_open(
        &self,
        attempt: u32,
        waits_so_far: u32,
        retry_after: Duration,
    ) -> RetryDecision {
        if waits_so_far >= self.max_circuit_waits {
            return RetryDecision::Exhausted { attempts: attempt };
        }
        let floor = Duration::from_millis(self.base_delay_ms);
        RetryDecision::Retry {
            next_attempt: attempt,
            delay: retry_after.max(floor),
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 1s base, 2x multiplier, 60s cap, 5 circuit waits.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            max_circuit_waits: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_ms(0), 0);
        assert_eq!(p.backoff_ms(1), 1_000);
        assert_eq!(p.backoff_ms(2), 2_000);
        assert_eq!(p.backoff_ms(3), 4_000);
    }

    #[test]
    fn test_backoff_capped() {
        let p = RetryPolicy {
            max_delay_ms: 3_000,
            ..Default::default()
        };
        assert_eq!(p.backoff_ms(3), 3_000);
        assert_eq!(p.backoff_ms(200), 3_000);
        assert_eq!(p.backoff_ms(u32::MAX), 3_000);
    }

    #[test]
    fn test_three_retries_then_exhausted() {
        let p = RetryPolicy::default();
        let delays: Vec<RetryDecision> = (1..=4)
            .map(|attempt| p.on_failure(attempt, FailureKind::Transient))
            .collect();

        assert_eq!(
            delays[0],
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            delays[1],
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            delays[2],
            RetryDecision::Retry {
                next_attempt: 4,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(delays[3], RetryDecision::Exhausted { attempts: 4 });
    }

    #[test]
    fn test_validation_never_retried() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.on_failure(1, FailureKind::Validation),
            RetryDecision::NotRetriable {
                kind: FailureKind::Validation
            }
        );
    }

    #[test]
    fn test_zero_retries() {
        let p = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(
            p.on_failure(1, FailureKind::Transient),
            RetryDecision::Exhausted { attempts: 1 }
        );
    }

    #[test]
    fn test_circuit_open_does_not_consume_attempt() {
        let p = RetryPolicy::default();
        let d = p.on_circuit_open(2, 0, Duration::from_secs(10));
        assert_eq!(
            d,
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(10)
            }
        );
        // Never waits less than the base delay.
        let d = p.on_circuit_open(2, 1, Duration::ZERO);
        assert_eq!(
            d,
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            p.on_circuit_open(2, 5, Duration::from_secs(1)),
            RetryDecision::Exhausted { attempts: 2 }
        );
    }
}
