//! Retry and reconnect policies.
//!
//! [`RetryPolicy`] bounds how many times the session repeats one exchange before
//! giving up on the line, and [`ReconnectBackoff`] produces the growing delay
//! between reconnect attempts after a fault.

use crate::config::SessionSettings;
use std::time::Duration;

/// Defines how often a single request is attempted on the wire.
///
/// # Example
///
/// ```rust
/// use genesys_psu::error_recovery::RetryPolicy;
///
/// let policy = RetryPolicy { max_attempts: 3 };
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// True if another attempt is allowed after `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl From<&SessionSettings> for RetryPolicy {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
        }
    }
}

/// Exponential backoff between reconnect attempts, capped at a maximum delay.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    next: Duration,
}

impl ReconnectBackoff {
    /// Create a backoff starting at `initial` and never exceeding `max`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            next: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown = self.next.as_secs_f64() * self.multiplier;
        self.next = if grown >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(grown)
        };
        delay
    }

    /// Start over from the initial delay (after a successful connect).
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl From<&SessionSettings> for ReconnectBackoff {
    fn from(settings: &SessionSettings) -> Self {
        Self::new(
            settings.initial_backoff,
            settings.max_backoff,
            settings.backoff_multiplier,
        )
    }
}
