//! Exponential backoff for connection establishment.

use std::time::Duration;

/// Retry spacing for `connect()`.
///
/// A pure value: every `connect()` call starts a fresh [`Backoff`] from it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Growth factor applied after each further failure.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_750),
            multiplier: 1.75,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Returns the delay to wait after the `attempt`-th failure (1-based).
    /// Returns `None` once `attempt` reaches `max_attempts`: there is nothing left to wait for.
    /// Saturates at `max_delay`, including for overflowing or non-finite growth.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let delay = Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay));
        Some(delay)
    }

    /// Start tracking a new sequence of attempts.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Attempt counter for one `connect()` call.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Record the start of another attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        self.policy.delay_after(self.attempt)
    }
}
