//! Retry policy for opening remote sessions.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    /// Keep trying until the remote end comes back.
    Unbounded,
    /// Number of retries allowed after the first failed attempt. `Limited(n)`
    /// makes at most `n + 1` attempts, so `n + 1` straight failures give up
    /// and `n` failures followed by a success succeed.
    Limited(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: Retries,
    /// Wait between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Build a policy from the raw `(max_retries, interval_seconds)` pair.
    /// A negative `max_retries` means retry forever.
    pub fn from_raw(max_retries: i64, interval_secs: u64) -> Self {
        let retries = match u32::try_from(max_retries) {
            Ok(n) => Retries::Limited(n),
            Err(_) if max_retries < 0 => Retries::Unbounded,
            Err(_) => Retries::Limited(u32::MAX),
        };
        Self {
            retries,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self {
            retries: Retries::Limited(0),
            interval: Duration::ZERO,
        }
    }

    pub const fn forever(interval: Duration) -> Self {
        Self {
            retries: Retries::Unbounded,
            interval,
        }
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self.retries {
            Retries::Unbounded => true,
            Retries::Limited(n) => failures <= n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_means_unbounded() {
        let policy = RetryPolicy::from_raw(-1, 5);
        assert_eq!(policy.retries, Retries::Unbounded);
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert!(policy.allows_retry(u32::MAX));
    }

    #[test]
    fn test_zero_retries_allows_single_attempt() {
        let policy = RetryPolicy::from_raw(0, 0);
        assert_eq!(policy, RetryPolicy::once());
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn test_limited_counts_retries_after_first_failure() {
        let policy = RetryPolicy::from_raw(2, 0);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }
}
