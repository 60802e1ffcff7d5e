//! The tiered limiter that callers talk to.
//!
//! Backends are handed in already constructed; the limiter only decides the
//! call order and what to do when a tier fails. Order is cache, relational,
//! in-process. A failing tier is skipped for that call only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::backend::{CounterBackend, Tier};
use super::clock::{Clock, SystemClock};
use super::counter::{Decision, WindowCounter, WindowLimit};
use super::memory::{MemoryBackend, DEFAULT_SWEEP_INTERVAL};
use crate::error::{BackendFailure, Result, WindowguardError};

/// Default bound on a single cache or relational round trip.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// What to decide when every configured tier fails for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request. No cross-instance limit is enforced while this applies.
    #[default]
    Open,
    /// Deny the request until one window has passed.
    Closed,
}

/// Single entry point for rate limit checks.
pub struct TieredLimiter {
    cache: Option<Arc<dyn CounterBackend>>,
    relational: Option<Arc<dyn CounterBackend>>,
    in_process: Option<Arc<MemoryBackend>>,
    forced_tier: Option<Tier>,
    failure_policy: FailurePolicy,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
    defaults: WindowLimit,
}

/// Builder for [`TieredLimiter`].
pub struct TieredLimiterBuilder {
    limiter: TieredLimiter,
}

impl TieredLimiterBuilder {
    pub fn cache(mut self, backend: Arc<dyn CounterBackend>) -> Self {
        self.limiter.cache = Some(backend);
        self
    }

    pub fn relational(mut self, backend: Arc<dyn CounterBackend>) -> Self {
        self.limiter.relational = Some(backend);
        self
    }

    pub fn in_process(mut self, backend: Arc<MemoryBackend>) -> Self {
        self.limiter.in_process = Some(backend);
        self
    }

    /// Route every call to `tier` only, skipping the others.
    pub fn forced_tier(mut self, tier: Tier) -> Self {
        self.limiter.forced_tier = Some(tier);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.limiter.failure_policy = policy;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.limiter.call_timeout = timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter.clock = clock;
        self
    }

    /// Limit applied by [`TieredLimiter::check_default`].
    pub fn defaults(mut self, limit: WindowLimit) -> Self {
        self.limiter.defaults = limit;
        self
    }

    pub fn build(self) -> TieredLimiter {
        self.limiter
    }
}

impl TieredLimiter {
    /// Start building a limiter with no tiers configured.
    pub fn builder() -> TieredLimiterBuilder {
        TieredLimiterBuilder {
            limiter: TieredLimiter {
                cache: None,
                relational: None,
                in_process: None,
                forced_tier: None,
                failure_policy: FailurePolicy::default(),
                call_timeout: DEFAULT_CALL_TIMEOUT,
                clock: Arc::new(SystemClock),
                defaults: WindowLimit::default(),
            },
        }
    }

    /// A limiter with only the in-process tier. Suitable for a single instance.
    ///
    /// Must be called inside a tokio runtime: the sweep of expired counters is
    /// spawned here and runs every [`DEFAULT_SWEEP_INTERVAL`].
    pub fn in_process_only() -> Self {
        let memory = MemoryBackend::new();
        memory.start_sweeper(DEFAULT_SWEEP_INTERVAL);
        Self::builder().in_process(Arc::new(memory)).build()
    }

    /// Check `key` against `max` requests per `window_ms` milliseconds.
    ///
    /// Errors only on an invalid limit; backend failures are absorbed.
    pub async fn check_limit(&self, key: &str, max: u64, window_ms: u64) -> Result<Decision> {
        let limit = WindowLimit::from_millis(max, window_ms)?;
        Ok(self.check(key, &limit).await)
    }

    /// Check `key` against the configured default limit.
    pub async fn check_default(&self, key: &str) -> Decision {
        let limit = self.defaults;
        self.check(key, &limit).await
    }

    /// Check `key` against `limit`, falling through tiers on failure.
    #[instrument(skip(self, limit), fields(max = limit.max(), window_ms = limit.window_ms()))]
    pub async fn check(&self, key: &str, limit: &WindowLimit) -> Decision {
        let mut failed: Vec<Tier> = Vec::new();

        for tier in Tier::ORDER {
            if self.forced_tier.is_some_and(|forced| forced != tier) {
                continue;
            }
            let Some(backend) = self.backend(tier) else {
                continue;
            };

            if tier == Tier::InProcess && !failed.is_empty() {
                warn!(
                    key = %key,
                    failed = ?failed,
                    "Degrading to in-process rate limiting; limits are not shared across instances"
                );
            }

            // Earlier tiers may have spent up to a full timeout; each attempt
            // starts its window from its own reading of the clock.
            let now_ms = self.clock.now_ms();
            match self.call(backend, key, limit, now_ms).await {
                Ok(counter) => {
                    let decision = counter.decide(limit, self.clock.now_ms(), tier);
                    if decision.allowed {
                        trace!(key = %key, tier = %tier, count = counter.count, "Request allowed");
                    } else {
                        debug!(
                            key = %key,
                            tier = %tier,
                            count = counter.count,
                            retry_after_secs = ?decision.retry_after_secs,
                            "Rate limit exceeded"
                        );
                    }
                    return decision;
                }
                Err(err) => {
                    warn!(key = %key, tier = %tier, error = %err, "Rate limit tier failed, trying next tier");
                    failed.push(tier);
                }
            }
        }

        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    key = %key,
                    failed = ?failed,
                    "No rate limit tier available, failing open; no cross-instance limit is in effect"
                );
                Decision::fail_open()
            }
            FailurePolicy::Closed => {
                warn!(key = %key, failed = ?failed, "No rate limit tier available, failing closed");
                Decision::fail_closed(limit)
            }
        }
    }

    /// Tiers configured, in call order.
    pub fn configured_tiers(&self) -> Vec<Tier> {
        Tier::ORDER
            .into_iter()
            .filter(|tier| self.backend(*tier).is_some())
            .collect()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn backend(&self, tier: Tier) -> Option<&dyn CounterBackend> {
        match tier {
            Tier::Cache => self.cache.as_deref(),
            Tier::Relational => self.relational.as_deref(),
            Tier::InProcess => self
                .in_process
                .as_deref()
                .map(|backend| backend as &dyn CounterBackend),
        }
    }

    async fn call(
        &self,
        backend: &dyn CounterBackend,
        key: &str,
        limit: &WindowLimit,
        now_ms: i64,
    ) -> Result<WindowCounter> {
        let tier = backend.tier();
        if tier == Tier::InProcess {
            return backend.hit(key, limit, now_ms).await;
        }

        match tokio::time::timeout(self.call_timeout, backend.hit(key, limit, now_ms)).await {
            Ok(result) => result,
            Err(_) => Err(WindowguardError::unavailable(
                tier,
                BackendFailure::Timeout(self.call_timeout),
            )),
        }
    }
}
