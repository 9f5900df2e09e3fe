//! Backoff computation shared by the adapter and the engine

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::{RetryConfig, duration_from_secs};

use super::error::{FailureKind, UpstreamFailure};

/// How long to wait between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub retry_after_max: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: duration_from_secs(config.backoff_base_seconds),
            max: duration_from_secs(config.backoff_max_seconds),
            retry_after_max: duration_from_secs(config.retry_after_max_seconds),
            jitter: config.jitter,
        }
    }

    /// Exponential delay after the given 1-based attempt: `base * 2^(attempt-1)`, capped.
    ///
    /// With jitter the result is drawn uniformly from `[delay/2, delay]`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let half = delay / 2;
        let spread = delay.saturating_sub(half).as_millis() as u64;
        let extra = rand::thread_rng().gen_range(0..=spread);
        half + Duration::from_millis(extra)
    }

    /// Delay before the attempt that follows `failure`.
    ///
    /// A rate limit carrying `Retry-After` waits exactly that long (capped);
    /// everything else backs off exponentially.
    pub fn delay_for(&self, failure: &UpstreamFailure, attempt: u32) -> Duration {
        match (failure.kind, failure.retry_after) {
            (FailureKind::RateLimited, Some(retry_after)) => retry_after.min(self.retry_after_max),
            _ => self.exponential(attempt),
        }
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    parse_retry_after_at(value, Utc::now())
}

fn parse_retry_after_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            retry_after_max: Duration::from_secs(5),
            jitter,
        }
    }

    #[test]
    fn test_exponential_without_jitter() {
        let policy = policy(false);
        assert_eq!(policy.exponential(1), Duration::from_millis(100));
        assert_eq!(policy.exponential(2), Duration::from_millis(200));
        assert_eq!(policy.exponential(3), Duration::from_millis(400));
        assert_eq!(policy.exponential(5), Duration::from_secs(1));
        assert_eq!(policy.exponential(60), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_with_jitter_stays_in_range() {
        let policy = policy(true);
        for attempt in 1..6 {
            let ceiling = self::policy(false).exponential(attempt);
            for _ in 0..50 {
                let delay = policy.exponential(attempt);
                assert!(delay >= ceiling / 2, "{delay:?} below half of {ceiling:?}");
                assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_retry_after_is_honored_and_capped() {
        let policy = policy(true);
        let failure = UpstreamFailure::from_response(
            429,
            Bytes::new(),
            None,
            Some(Duration::from_secs(2)),
        );
        assert_eq!(policy.delay_for(&failure, 1), Duration::from_secs(2));

        let failure = UpstreamFailure::from_response(
            429,
            Bytes::new(),
            None,
            Some(Duration::from_secs(600)),
        );
        assert_eq!(policy.delay_for(&failure, 1), Duration::from_secs(5));
    }

    #[test]
    fn test_rate_limit_without_retry_after_backs_off() {
        let policy = policy(false);
        let failure = UpstreamFailure::from_response(429, Bytes::new(), None, None);
        assert_eq!(policy.delay_for(&failure, 2), Duration::from_millis(200));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_out_of_range() {
        assert_eq!(parse_retry_after("1e30"), None);
        assert_eq!(parse_retry_after("NaN"), None);
        assert_eq!(parse_retry_after("inf"), None);
    }

    #[test]
    fn test_from_config_with_huge_values_does_not_panic() {
        let config = RetryConfig {
            backoff_max_seconds: 1e30,
            retry_after_max_seconds: f64::INFINITY,
            ..RetryConfig::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.max, Duration::from_secs(86_400));
        assert_eq!(policy.retry_after_max, Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);

        let delay = parse_retry_after_at("Wed, 21 Oct 2015 07:28:10 GMT", now);
        assert_eq!(delay, Some(Duration::from_secs(10)));

        let past = parse_retry_after_at("Wed, 21 Oct 2015 07:27:00 GMT", now);
        assert_eq!(past, Some(Duration::ZERO));
    }
}
