//! Fixed-window counter records and the decisions derived from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backend::Tier;
use crate::error::{Result, WindowguardError};

/// Default maximum requests per window.
pub const DEFAULT_MAX: u64 = 10;
/// Default window length in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// A validated `(max, window)` pair.
///
/// Both values are at least one; a limit that could never admit a request is
/// rejected at construction time rather than at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowLimit {
    max: u64,
    window_ms: u64,
}

impl WindowLimit {
    /// Create a new limit of `max` operations per `window`.
    pub fn new(max: u64, window: Duration) -> Result<Self> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        Self::from_millis(max, window_ms)
    }

    /// Create a new limit from a window length in milliseconds.
    pub fn from_millis(max: u64, window_ms: u64) -> Result<Self> {
        if max == 0 {
            return Err(WindowguardError::InvalidLimit(
                "max must be at least 1".to_string(),
            ));
        }
        if window_ms == 0 {
            return Err(WindowguardError::InvalidLimit(
                "window must be at least 1ms".to_string(),
            ));
        }
        Ok(Self { max, window_ms })
    }

    /// Maximum operations admitted per window.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Window length in whole seconds, rounded up.
    pub fn window_secs_ceil(&self) -> u64 {
        self.window_ms.div_ceil(1000)
    }
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

/// The state of one key's current window, as returned by a backend after it
/// has atomically applied a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    /// Opaque identifier of the limited subject
    pub key: String,
    /// Operations counted in the current window, including the one just applied
    pub count: u64,
    /// Epoch milliseconds at which the current window ends
    pub reset_at_ms: i64,
}

impl WindowCounter {
    /// Start a fresh window for `key` at `now_ms`.
    pub fn start(key: &str, now_ms: i64, limit: &WindowLimit) -> Self {
        Self {
            key: key.to_string(),
            count: 1,
            reset_at_ms: window_end(now_ms, limit),
        }
    }

    /// Whether the window has ended as of `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.reset_at_ms
    }

    /// Apply one hit: restart the window if it has ended, otherwise count up.
    ///
    /// Callers must hold whatever guard makes this read-modify-write atomic.
    pub fn hit(&mut self, now_ms: i64, limit: &WindowLimit) {
        if self.is_expired(now_ms) {
            self.count = 1;
            self.reset_at_ms = window_end(now_ms, limit);
        } else {
            self.count = self.count.saturating_add(1);
        }
    }

    /// Whole seconds until the window resets, rounded up and never negative.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let remaining_ms = self.reset_at_ms.saturating_sub(now_ms).max(0) as u64;
        remaining_ms.div_ceil(1000)
    }

    /// Turn the post-hit state into a decision for the caller.
    pub fn decide(&self, limit: &WindowLimit, now_ms: i64, tier: Tier) -> Decision {
        let allowed = self.count <= limit.max();
        Decision {
            allowed,
            retry_after_secs: (!allowed).then(|| self.retry_after_secs(now_ms)),
            remaining: Some(limit.max().saturating_sub(self.count)),
            tier: Some(tier),
        }
    }
}

fn window_end(now_ms: i64, limit: &WindowLimit) -> i64 {
    now_ms.saturating_add(i64::try_from(limit.window_ms()).unwrap_or(i64::MAX))
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Seconds until the window resets; present only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Operations left in the current window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// The tier that produced this decision; absent when the failure policy decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl Decision {
    /// An admission made without any backend, under the fail-open policy.
    pub fn fail_open() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
            remaining: None,
            tier: None,
        }
    }

    /// A denial made without any backend, under the fail-closed policy.
    pub fn fail_closed(limit: &WindowLimit) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(limit.window_secs_ceil()),
            remaining: None,
            tier: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max: u64, window_ms: u64) -> WindowLimit {
        WindowLimit::from_millis(max, window_ms).unwrap()
    }

    #[test]
    fn test_limit_rejects_zero_values() {
        assert!(matches!(
            WindowLimit::from_millis(0, 1000),
            Err(WindowguardError::InvalidLimit(_))
        ));
        assert!(matches!(
            WindowLimit::new(5, Duration::ZERO),
            Err(WindowguardError::InvalidLimit(_))
        ));
        assert_eq!(limit(1, 1).window(), Duration::from_millis(1));
    }

    #[test]
    fn test_counter_increments_within_window() {
        let l = limit(5, 1000);
        let mut counter = WindowCounter::start("k", 0, &l);
        assert_eq!(counter.count, 1);
        assert_eq!(counter.reset_at_ms, 1000);

        counter.hit(500, &l);
        assert_eq!(counter.count, 2);
        // An increment never moves the window end
        assert_eq!(counter.reset_at_ms, 1000);
    }

    #[test]
    fn test_counter_restarts_after_reset() {
        let l = limit(5, 1000);
        let mut counter = WindowCounter::start("k", 0, &l);
        counter.hit(10, &l);
        counter.hit(1000, &l);
        assert_eq!(counter.count, 1);
        assert_eq!(counter.reset_at_ms, 2000);
    }

    #[test]
    fn test_decide_denies_past_max() {
        let l = limit(2, 1000);
        let mut counter = WindowCounter::start("ip:203.0.113.5", 0, &l);
        assert!(counter.decide(&l, 0, Tier::InProcess).allowed);

        counter.hit(10, &l);
        let decision = counter.decide(&l, 10, Tier::InProcess);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(0));
        assert_eq!(decision.retry_after_secs, None);

        counter.hit(20, &l);
        let decision = counter.decide(&l, 20, Tier::InProcess);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(1));
    }

    #[test]
    fn test_retry_after_rounds_up_and_never_negative() {
        let l = limit(1, 2500);
        let counter = WindowCounter::start("k", 0, &l);
        assert_eq!(counter.retry_after_secs(0), 3);
        assert_eq!(counter.retry_after_secs(1500), 1);
        assert_eq!(counter.retry_after_secs(2500), 0);
        assert_eq!(counter.retry_after_secs(9000), 0);
    }

    #[test]
    fn test_policy_decisions() {
        let l = limit(3, 1500);
        assert!(Decision::fail_open().allowed);
        let closed = Decision::fail_closed(&l);
        assert!(!closed.allowed);
        assert_eq!(closed.retry_after_secs, Some(2));
        assert_eq!(closed.tier, None);
    }
}
