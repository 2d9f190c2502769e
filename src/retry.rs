//! Retry schedules for link attach and broker reconnection.

use std::time::Duration;

/// Explicit retry schedule: a base interval, an optional growth factor and an
/// optional attempt ceiling. Production policies leave `max_attempts` unset
/// and retry forever; tests inject a ceiling to bound execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub multiplier: u32,
    pub max_interval: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Fixed delay, unbounded attempts.
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            multiplier: 1,
            max_interval: interval,
            max_attempts: None,
        }
    }

    /// Fixed delay, at most `max_attempts` attempts.
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self::forever(interval).with_max_attempts(Some(max_attempts))
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Grows the delay by `multiplier` after each failed attempt, capped at `max_interval`.
    pub fn with_backoff(mut self, multiplier: u32, max_interval: Duration) -> Self {
        self.multiplier = multiplier.max(1);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1 {
            return self.interval;
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.saturating_pow(exponent);
        self.interval
            .checked_mul(factor)
            .map_or(self.max_interval, |delay| delay.min(self.max_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forever_never_exhausts() {
        let policy = RetryPolicy::forever(Duration::from_secs(5));
        assert!(policy.allows(0));
        assert!(policy.allows(u32::MAX - 1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_bounded_stops_at_ceiling() {
        let policy = RetryPolicy::bounded(Duration::from_millis(500), 3);
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::forever(Duration::from_millis(100))
            .with_backoff(2, Duration::from_millis(1000));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }
}
