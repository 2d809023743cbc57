//! How long to back off when the chat platform answers 429.

use std::time::Duration;

/// Bounded retries for rate-limited requests.
///
/// The platform's `Retry-After` hint is honoured when present; otherwise the
/// wait doubles from `fallback_wait` per retry. Every wait is capped at
/// `max_wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Retries after the first rate-limited response.
    pub max_retries: u32,
    pub fallback_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            fallback_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RateLimitPolicy {
    /// Fail on the first 429.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (1-based), or `None` once retries
    /// are spent.
    pub fn wait_before(&self, retry: u32, retry_after: Option<Duration>) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let wait = retry_after
            .unwrap_or_else(|| self.fallback_wait.saturating_mul(1 << (retry - 1).min(16)));
        Some(wait.min(self.max_wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_doubles_until_cap() {
        let policy = RateLimitPolicy {
            max_retries: 8,
            max_wait: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(policy.wait_before(1, None), Some(Duration::from_secs(1)));
        assert_eq!(policy.wait_before(2, None), Some(Duration::from_secs(2)));
        assert_eq!(policy.wait_before(3, None), Some(Duration::from_secs(4)));
        assert_eq!(policy.wait_before(8, None), Some(Duration::from_secs(5)));
    }

    #[test]
    fn platform_hint_wins_but_is_capped() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.wait_before(1, Some(Duration::from_millis(250))),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            policy.wait_before(2, Some(Duration::from_secs(600))),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn retries_are_bounded() {
        let policy = RateLimitPolicy::default();
        assert!(policy.wait_before(2, None).is_some());
        assert_eq!(policy.wait_before(3, None), None);
        assert_eq!(policy.wait_before(0, None), None);
        assert_eq!(RateLimitPolicy::none().wait_before(1, Some(Duration::ZERO)), None);
    }
}
