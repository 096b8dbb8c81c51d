//! Backoff for collaborators that reconnect.
//!
//! The client itself never retries. A caller that wants to survive a dropped
//! connection watches [`GatewayClient::state_changes`] and schedules
//! `connect()` with a [`RetryPolicy`].
//!
//! [`GatewayClient::state_changes`]: crate::gateway::GatewayClient::state_changes

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first; `0` retries forever.
    pub max_attempts: u32,
    /// Delay before the first retry, and the floor for every jittered delay.
    pub base_delay: Duration,
    /// Cap for later retries.
    pub max_delay: Duration,
    /// Jitter ratio (0.0..=1.0) applied to each delay.
    pub jitter_ratio: f64,
    /// A connection that stayed open this long resets the backoff.
    pub stable_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect_default()
    }
}

impl RetryPolicy {
    /// Policy for re-establishing a dropped gateway connection.
    pub fn reconnect_default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.20,
            stable_after: Duration::from_secs(60),
        }
    }

    /// A policy that gives up after `max_attempts` connects.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::reconnect_default()
        }
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Whether a connection that was up for `uptime` counts as healthy.
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.stable_after
    }

    /// `base_delay * 2^(retry_index - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let doublings = retry_index.saturating_sub(1);
        let factor = 2u32.saturating_pow(doublings);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff delay for `retry_index` with jitter applied.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        self.with_jitter(self.backoff_delay(retry_index))
    }

    /// Pick a delay in `delay ± delay * jitter_ratio`, never below
    /// `base_delay` nor above `max_delay`.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        let delay = delay.min(self.max_delay);
        let floor = self.base_delay.min(self.max_delay);
        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let low = delay.mul_f64(1.0 - ratio).clamp(floor, self.max_delay);
        let high = delay.mul_f64(1.0 + ratio).clamp(floor, self.max_delay);
        if low >= high {
            return low;
        }
        rand::thread_rng().gen_range(low..=high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_ratio: 0.0,
            stable_after: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(200), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy {
            jitter_ratio: 0.25,
            ..no_jitter()
        };
        for _ in 0..200 {
            let delay = policy.with_jitter(Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(300), "{delay:?}");
            assert!(delay <= Duration::from_millis(500), "{delay:?}");
        }
        assert_eq!(no_jitter().delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn jitter_never_undercuts_base_delay() {
        let policy = RetryPolicy {
            jitter_ratio: 1.0,
            ..no_jitter()
        };
        for _ in 0..200 {
            let first = policy.delay_for(1);
            assert!(first >= Duration::from_millis(100), "{first:?}");
            assert!(first <= Duration::from_millis(200), "{first:?}");
            let capped = policy.delay_for(10);
            assert!(capped <= Duration::from_millis(500), "{capped:?}");
        }
    }

    #[test]
    fn stability_window() {
        let policy = no_jitter();
        assert!(!policy.is_stable(Duration::from_secs(2)));
        assert!(policy.is_stable(Duration::from_secs(10)));
    }

    #[test]
    fn attempt_budget() {
        let bounded = no_jitter();
        assert!(bounded.should_retry(2));
        assert!(!bounded.should_retry(3));
        assert!(RetryPolicy::reconnect_default().should_retry(10_000));
        assert_eq!(RetryPolicy::bounded(5).max_attempts, 5);
    }
}
