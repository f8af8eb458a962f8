//! Dispatch retry policy
//!
//! Delay for attempt n is `min(max_delay, initial × multiplier^(n−1))`
//! with ±jitter. Retryable outcomes are upstream 91/96/68 (and the
//! synthesized ND), timeouts and connection loss; every retry reuses the
//! original STAN so upstream dedup stays anchored.

use std::time::Duration;

use rand::Rng;

use fep_types::{codes, FepError, RetryConfig};

/// Retry decisions and delays over one [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy applied to financial transactions: two retries after the
    /// initial dispatch
    pub fn financial() -> Self {
        Self::new(RetryConfig::financial())
    }

    /// Attempts including the first dispatch
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether attempt `attempt` (1-based) may be followed by another
    pub fn attempts_remain(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }

    /// Jittered delay before the retry following attempt `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.config.delay_for_attempt(attempt) as f64;
        let jitter = self.config.jitter_factor;
        let ms = if jitter > 0.0 {
            let spread = base * jitter;
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Whether an upstream response code permits a retry
    pub fn retryable_code(&self, code: &str) -> bool {
        codes::is_retryable(code)
    }

    /// Whether an error kind permits a retry (timeout, connection reset,
    /// I/O). Parse and security failures never do.
    pub fn retryable_error(&self, error: &FepError) -> bool {
        error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
            jitter_factor: jitter,
        })
    }

    #[test]
    fn delays_grow_exponentially_then_cap() {
        let p = policy(0.0);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = policy(0.5);
        for _ in 0..100 {
            let d = p.delay_after(1).as_millis() as i64;
            assert!((50..=150).contains(&d), "delay {} outside band", d);
        }
    }

    #[test]
    fn attempts_accounting() {
        let p = policy(0.0);
        assert!(p.attempts_remain(1));
        assert!(p.attempts_remain(2));
        assert!(!p.attempts_remain(3));
    }

    #[test]
    fn retryable_classification() {
        let p = policy(0.0);
        assert!(p.retryable_code("91"));
        assert!(p.retryable_code("96"));
        assert!(p.retryable_code("68"));
        assert!(p.retryable_code("ND"));
        assert!(!p.retryable_code("94"));
        assert!(!p.retryable_code("00"));
        assert!(p.retryable_error(&FepError::Timeout { after_ms: 1 }));
        assert!(p.retryable_error(&FepError::connection("reset")));
        assert!(!p.retryable_error(&FepError::security("mac")));
    }
}
