use std::time::Duration;

use crate::config::RetryConfig;

/// Classification of a failure for backoff purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect, transfer, or task deadline).
    Timeout,
    /// Server asked us to slow down (429, 503).
    Throttled,
    /// Network-level failure (reset, DNS, short read).
    Connection,
    /// Retryable server error (5xx other than 503).
    Http5xx(u16),
    /// Anything else; not retried.
    Other,
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts per connection (including the first).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        let base = if cfg.base_delay_secs.is_finite() && cfg.base_delay_secs > 0.0 {
            Duration::from_secs_f64(cfg.base_delay_secs)
        } else {
            Duration::ZERO
        };
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: base,
            max_delay: Duration::from_secs(cfg.max_delay_secs),
        }
    }

    /// Backoff for a failed `attempt` (1-based).
    ///
    /// Delay is `base * 2^(attempt-1)`, capped at `max_delay`. Returns
    /// `NoRetry` once `attempt` reaches `max_attempts` or the kind is `Other`.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts || kind == ErrorKind::Other {
            return RetryDecision::NoRetry;
        }
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_is_never_retried() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Other), RetryDecision::NoRetry);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = RetryPolicy {
            max_attempts: 20,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(
            p.decide(1, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(2, ErrorKind::Connection),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(10, ErrorKind::Throttled),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn attempts_are_bounded() {
        let p = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(matches!(p.decide(2, ErrorKind::Http5xx(502)), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, ErrorKind::Http5xx(502)), RetryDecision::NoRetry);
    }

    #[test]
    fn from_config_converts_units() {
        let p = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            base_delay_secs: 0.5,
            max_delay_secs: 15,
        });
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.base_delay, Duration::from_millis(500));
        assert_eq!(p.max_delay, Duration::from_secs(15));
    }
}
