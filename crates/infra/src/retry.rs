//! Retry policy shared by the command dispatcher and the outbox relay.
//!
//! Both callers face the same problem: a transient failure (optimistic
//! concurrency conflict, bus outage) that is worth retrying a bounded number
//! of times with growing delays. The policy is pure arithmetic; the caller
//! owns the sleep.

use std::time::Duration;

/// How the delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// Doubles per attempt: base, base*2, base*4, ... capped at `max_delay`.
    Exponential,
}

/// Bounded retry with backoff and deterministic jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed (first try included).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor in `[0.0, 1.0]`; `0.0` disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Whether another attempt is allowed after `attempts` completed tries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after the given 1-indexed attempt failed.
    ///
    /// Jitter is derived from the attempt number rather than a RNG, so retry
    /// schedules are reproducible in tests and log timelines.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempt as i32 - 1),
        };
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter > 0.0 {
            let jitter_range = capped_ms * self.jitter;
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            let jitter = jitter_range * (pseudo_random - 0.5) * 2.0;
            (capped_ms + jitter).max(0.0)
        } else {
            capped_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_the_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(1000));
    }

    #[test]
    fn fixed_never_grows() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn should_retry_respects_the_bound() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn jitter_stays_within_the_configured_band() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        for attempt in 1..=5 {
            let base = RetryPolicy {
                jitter: 0.0,
                ..policy.clone()
            }
            .delay_for_attempt(attempt)
            .as_millis() as f64;
            let jittered = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((jittered - base).abs() <= base * policy.jitter + 1.0);
        }
    }

    #[test]
    fn jitter_is_deterministic() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(2), policy.delay_for_attempt(2));
    }
}
