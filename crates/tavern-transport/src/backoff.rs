//! Reconnection backoff state machine.
//!
//! Attempt `n` (1-based) waits `min(base * 2^(n-1), max)`. After
//! `max_attempts` consecutive failures the machine is exhausted until
//! [`Reconnector::reset`] is called by an explicit connect.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ReconnectConfig;

/// Delay before attempt `attempt` (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent).min(max)
}

/// Result of scheduling after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Stop retrying.
    Exhausted { attempts: u32 },
}

/// Reconnection schedule.
#[derive(Debug, Clone)]
pub struct Reconnector {
    config: ReconnectConfig,
    attempt: u32,
    next_retry_at: Option<Instant>,
    exhausted: bool,
}

impl Reconnector {
    /// Create an idle reconnector.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            next_retry_at: None,
            exhausted: false,
        }
    }

    /// Schedule the next attempt after a loss or a failed attempt.
    pub fn schedule(&mut self, now: Instant) -> RetryDecision {
        if self.attempt >= self.config.max_attempts {
            self.exhausted = true;
            self.next_retry_at = None;
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }

        self.attempt += 1;
        let delay = backoff_delay(
            self.attempt,
            self.config.base_delay(),
            self.config.max_delay(),
        );
        self.next_retry_at = Some(now + delay);
        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Whether a scheduled attempt is due.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_retry_at.is_some_and(|at| now >= at)
    }

    /// Consume the scheduled slot; returns the attempt number.
    pub const fn begin_attempt(&mut self) -> u32 {
        self.next_retry_at = None;
        self.attempt
    }

    /// Forget all failures (successful connect or explicit connect/disconnect).
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.next_retry_at = None;
        self.exhausted = false;
    }

    /// Attempts made in the current cycle.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// When the next attempt is due.
    #[must_use]
    pub const fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    /// Whether retrying has been given up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (1..=8)
            .map(|n| backoff_delay(n, base, max).as_secs())
            .collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff_delay(200, base, max), max);
    }

    #[test]
    fn test_five_attempts_then_exhausted() {
        let mut reconnector = Reconnector::new(ReconnectConfig::default());
        let mut now = Instant::now();
        let mut delays = Vec::new();

        loop {
            match reconnector.schedule(now) {
                RetryDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    assert!(!reconnector.is_due(now + delay - Duration::from_millis(1)));
                    now += delay;
                    assert!(reconnector.is_due(now));
                    assert_eq!(reconnector.begin_attempt(), attempt);
                    assert!(!reconnector.is_due(now));
                    delays.push(delay.as_secs());
                }
                RetryDecision::Exhausted { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
            }
        }

        assert_eq!(delays, [1, 2, 4, 8, 16]);
        assert!(reconnector.is_exhausted());
        assert!(reconnector.next_retry_at().is_none());
    }

    #[test]
    fn test_reset_starts_a_new_cycle() {
        let mut reconnector = Reconnector::new(ReconnectConfig::default());
        let now = Instant::now();
        reconnector.schedule(now);
        reconnector.schedule(now);
        assert_eq!(reconnector.attempts(), 2);

        reconnector.reset();
        assert_eq!(reconnector.attempts(), 0);
        assert_eq!(
            reconnector.schedule(now),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn test_zero_attempts_exhausts_immediately() {
        let mut reconnector = Reconnector::new(ReconnectConfig {
            max_attempts: 0,
            ..ReconnectConfig::default()
        });
        assert_eq!(
            reconnector.schedule(Instant::now()),
            RetryDecision::Exhausted { attempts: 0 }
        );
    }
}
