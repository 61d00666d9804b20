//! Backoff schedule and the sleeping seam used between attempts.
//!
//! # Design
//! `RetryPolicy` is pure data: given an attempt number it yields a delay.
//! Whether an operation may be retried at all is decided by the client.
//! Sleeping goes through `Sleeper` so tests can record delays instead of
//! waiting for them.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancellationToken;

/// Capped exponential backoff with optional jitter.
///
/// The delay before retry `n` (1-based) is `base_delay * factor^(n-1)`,
/// capped at `max_delay`, plus up to half of that again as jitter (still
/// capped). With `factor >= 2` successive delays strictly increase until
/// the cap is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Longest `Retry-After` the client will wait out. A 429 asking for
    /// more is returned to the caller. Independent of `max_delay`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            factor: 2,
            max_delay: Duration::from_secs(5),
            jitter: true,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1 is the first retry), without
    /// jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Wait before retrying a 429: the backoff delay, stretched to the
    /// server's `Retry-After`. `None` when the server asks for longer than
    /// `max_retry_after`.
    pub fn rate_limit_delay(&self, retry: u32, retry_after: Option<Duration>) -> Option<Duration> {
        let backoff = self.delay(retry);
        match retry_after {
            Some(wait) if wait > self.max_retry_after => None,
            Some(wait) => Some(backoff.max(wait)),
            None => Some(backoff),
        }
    }

    /// Delay before retry number `retry`, with jitter if enabled.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let spread = nominal / 2;
        let extra = rand::thread_rng().gen_range(Duration::ZERO..spread.max(Duration::from_nanos(1)));
        (nominal + extra).min(self.max_delay)
    }
}

/// Waits between attempts.
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration` unless `cancel` fires first. Returns `true` if
    /// the sleep was cut short by cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Real sleeper that parks the calling thread and wakes on cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        cancel.wait(duration)
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        self.delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn nominal_delays_double_until_the_cap() {
        let policy = no_jitter();
        let delays: Vec<u128> = (1..=7).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, [200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn huge_retry_numbers_saturate_at_max_delay() {
        let policy = no_jitter();
        assert_eq!(policy.delay(200), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_half_of_nominal() {
        let policy = RetryPolicy::default();
        for retry in 1..=4 {
            let nominal = policy.nominal_delay(retry);
            for _ in 0..50 {
                let d = policy.delay(retry);
                assert!(d >= nominal, "{d:?} < {nominal:?}");
                assert!(d < nominal + nominal / 2, "{d:?} too large");
            }
        }
    }

    #[test]
    fn jittered_delays_strictly_increase() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delays: Vec<Duration> = (1..policy.max_attempts).map(|n| policy.delay(n)).collect();
            assert!(delays.windows(2).all(|w| w[0] < w[1]), "{delays:?}");
        }
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            assert!(policy.delay(6) <= policy.max_delay);
        }
    }

    #[test]
    fn retry_after_may_exceed_max_delay() {
        let policy = no_jitter();
        assert_eq!(
            policy.rate_limit_delay(1, Some(Duration::from_secs(30))),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            policy.rate_limit_delay(3, Some(Duration::from_millis(10))),
            Some(Duration::from_millis(800))
        );
        assert_eq!(policy.rate_limit_delay(1, None), Some(Duration::from_millis(200)));
        assert_eq!(policy.rate_limit_delay(1, Some(Duration::from_secs(121))), None);
    }

    #[test]
    fn recording_sleeper_keeps_delays() {
        let sleeper = RecordingSleeper::new();
        let token = CancellationToken::new();
        assert!(!sleeper.sleep(Duration::from_millis(5), &token));
        token.cancel();
        assert!(sleeper.sleep(Duration::from_millis(7), &token));
        assert_eq!(
            sleeper.delays(),
            [Duration::from_millis(5), Duration::from_millis(7)]
        );
    }
}
