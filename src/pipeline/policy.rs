//! Retry policy shared by every pipeline pass.
//!
//! All backoff delays and the abandonment ceiling are decided here, so
//! changing retry behavior never means hunting through the passes.

use chrono::{DateTime, Duration, Utc};

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: i64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay_secs: config.base_delay_secs,
            max_delay_secs: config.max_delay_secs,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(n-1), capped.
    pub fn delay_secs_for(&self, attempt: i64) -> u64 {
        let exp = (attempt - 1).clamp(0, 20) as u32;
        self.base_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_secs)
    }

    pub fn next_retry_at(&self, attempt: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.delay_secs_for(attempt) as i64)
    }

    /// Attempts are cumulative across stages for the life of an item.
    pub fn is_exhausted(&self, attempts: i64) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_secs: 30,
            max_delay_secs: 3600,
            max_attempts: 5,
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_secs_for(1), 30);
        assert_eq!(p.delay_secs_for(2), 60);
        assert_eq!(p.delay_secs_for(3), 120);
        assert_eq!(p.delay_secs_for(4), 240);
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_secs_for(10), 3600);
        assert_eq!(p.delay_secs_for(63), 3600);
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let p = policy();
        assert!(!p.is_exhausted(4));
        assert!(p.is_exhausted(5));
        assert!(p.is_exhausted(6));
    }

    #[test]
    fn next_retry_is_in_the_future() {
        let p = policy();
        let now = Utc::now();
        assert_eq!(p.next_retry_at(1, now), now + Duration::seconds(30));
    }
}
