//! In-process counter store.
//!
//! Counters live in a sharded concurrent map; every hit takes the shard's
//! write lock for the key, so checks for the same key never interleave.
//! A background sweep evicts windows that have already ended.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{CounterBackend, Tier};
use super::clock::{Clock, SystemClock};
use super::counter::{WindowCounter, WindowLimit};
use crate::error::Result;

/// Default interval between sweeps of expired counters.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

type CounterMap = DashMap<String, WindowCounter>;

/// Process-local window counters.
pub struct MemoryBackend {
    counters: Arc<CounterMap>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    /// Create an empty store using the system clock for sweeps.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store using `clock` for sweeps.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// Replaces any sweeper started earlier. The task stops when the
    /// backend is dropped.
    pub fn start_sweeper(&self, interval: Duration) {
        let counters: Weak<CounterMap> = Arc::downgrade(&self.counters);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(counters) = counters.upgrade() else {
                    break;
                };
                let evicted = sweep_map(&counters, clock.now_ms());
                if evicted > 0 {
                    debug!(evicted, remaining = counters.len(), "Swept expired counters");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Remove every counter whose window has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_map(&self.counters, self.clock.now_ms())
    }

    /// Snapshot of the counter for `key`, if one is live.
    pub fn get(&self, key: &str) -> Option<WindowCounter> {
        self.counters.get(key).map(|c| c.clone())
    }

    /// Number of counters currently held.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Apply one hit without going through the trait; this tier cannot fail.
    pub fn hit_local(&self, key: &str, limit: &WindowLimit, now_ms: i64) -> WindowCounter {
        trace!(key = %key, "Checking in-process counter");
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let counter = entry.get_mut();
                counter.hit(now_ms, limit);
                counter.clone()
            }
            Entry::Vacant(entry) => {
                debug!(key = %key, max = limit.max(), window_ms = limit.window_ms(), "Creating in-process counter");
                entry.insert(WindowCounter::start(key, now_ms, limit)).clone()
            }
        }
    }
}

fn sweep_map(counters: &CounterMap, now_ms: i64) -> usize {
    let before = counters.len();
    counters.retain(|_, counter| !counter.is_expired(now_ms));
    before.saturating_sub(counters.len())
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    fn tier(&self) -> Tier {
        Tier::InProcess
    }

    async fn hit(&self, key: &str, limit: &WindowLimit, now_ms: i64) -> Result<WindowCounter> {
        Ok(self.hit_local(key, limit, now_ms))
    }
}
