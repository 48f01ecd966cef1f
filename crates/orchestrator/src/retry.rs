//! Durable retry policy — exponential backoff with a hard deadline.

use std::time::Duration;

/// Exponential backoff: `initial * factor^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(initial: Duration, factor: f64, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            factor,
            max,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based). `None` once the
    /// attempt budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial.as_secs_f64() * self.factor.powi(exp);
        Some(Duration::from_secs_f64(raw.min(self.max.as_secs_f64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(5), 10);
        assert_eq!(policy.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay(4), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay(9), Some(Duration::from_secs(5)));
    }

    #[test]
    fn budget_exhausts() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(5), 3);
        assert!(policy.delay(2).is_some());
        assert_eq!(policy.delay(3), None);
        assert_eq!(policy.delay(4), None);
    }
}
