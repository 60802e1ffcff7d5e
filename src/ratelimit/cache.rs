//! Distributed cache counter store backed by Redis.
//!
//! The whole create-or-increment-and-read sequence runs as one Lua script on
//! the server, so concurrent replicas never race on a read followed by a
//! write. Window ends are derived from the key's remaining TTL, which keeps
//! the window length under the server's clock.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, IntoConnectionInfo, Script};
use tracing::{debug, trace, warn};

use super::backend::{CounterBackend, Tier};
use super::counter::{WindowCounter, WindowLimit};
use crate::error::{BackendFailure, Result, WindowguardError};

/// KEYS[1] = counter key, ARGV[1] = window in milliseconds.
/// Returns {count, remaining ttl in milliseconds}.
const HIT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// A counter configuration for one `(max, window)` pair.
///
/// Created the first time a pair is seen and reused for every key checked
/// under it.
#[derive(Debug)]
pub struct WindowScript {
    limit: WindowLimit,
    script: Script,
}

impl WindowScript {
    fn new(limit: WindowLimit) -> Self {
        Self {
            limit,
            script: Script::new(HIT_SCRIPT),
        }
    }

    pub fn limit(&self) -> &WindowLimit {
        &self.limit
    }
}

/// Redis-backed window counters.
pub struct CacheBackend {
    client: Client,
    key_prefix: String,
    connection: Mutex<Option<MultiplexedConnection>>,
    scripts: DashMap<WindowLimit, Arc<WindowScript>>,
}

impl CacheBackend {
    /// Create a backend for `url`, authenticating with `token`.
    ///
    /// No connection is made until the first hit.
    pub fn new(url: &str, token: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let mut info = url
            .into_connection_info()
            .map_err(|e| WindowguardError::Config(format!("invalid cache url: {}", e)))?;
        if !token.is_empty() {
            info.redis.password = Some(token.to_string());
        }
        let client = Client::open(info)
            .map_err(|e| WindowguardError::Config(format!("invalid cache url: {}", e)))?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            connection: Mutex::new(None),
            scripts: DashMap::new(),
        })
    }

    /// The counter configuration for `limit`, created on first use.
    pub fn script_for(&self, limit: &WindowLimit) -> Arc<WindowScript> {
        self.scripts
            .entry(*limit)
            .or_insert_with(|| {
                debug!(max = limit.max(), window_ms = limit.window_ms(), "Creating cache counter");
                Arc::new(WindowScript::new(*limit))
            })
            .clone()
    }

    /// Number of distinct `(max, window)` pairs seen so far.
    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    /// The Redis key a counter for `key` lives under.
    pub fn storage_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| WindowguardError::unavailable(Tier::Cache, e))?;
        debug!("Connected to cache backend");

        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    fn drop_connection(&self) {
        self.connection.lock().take();
    }
}

#[async_trait]
impl CounterBackend for CacheBackend {
    fn tier(&self) -> Tier {
        Tier::Cache
    }

    async fn hit(&self, key: &str, limit: &WindowLimit, now_ms: i64) -> Result<WindowCounter> {
        let handle = self.script_for(limit);
        let storage_key = self.storage_key(key);
        let mut conn = self.connection().await?;

        trace!(key = %key, "Checking cache counter");

        let reply: redis::RedisResult<(i64, i64)> = handle
            .script
            .key(&storage_key)
            .arg(handle.limit.window_ms())
            .invoke_async(&mut conn)
            .await;

        let (count, ttl_ms) = match reply {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    warn!(error = %e, "Cache connection lost, reconnecting on next call");
                    self.drop_connection();
                }
                return Err(WindowguardError::unavailable(Tier::Cache, e));
            }
        };

        if count < 1 {
            return Err(WindowguardError::unavailable(
                Tier::Cache,
                BackendFailure::Protocol(format!("counter {} for {}", count, storage_key)),
            ));
        }

        Ok(WindowCounter {
            key: key.to_string(),
            count: count as u64,
            reset_at_ms: now_ms.saturating_add(ttl_ms.max(0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn limit(max: u64, window_ms: u64) -> WindowLimit {
        WindowLimit::from_millis(max, window_ms).unwrap()
    }

    /// A live Redis, if the environment provides one.
    fn live_backend() -> Option<CacheBackend> {
        let url = std::env::var("WINDOWGUARD_TEST_REDIS_URL").ok()?;
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Some(CacheBackend::new(&url, "", format!("windowguard-test-{}", nonce)).unwrap())
    }

    #[test]
    fn test_one_script_per_limit_pair() {
        let backend = CacheBackend::new("redis://127.0.0.1:6379", "token", "wg").unwrap();

        let a = backend.script_for(&limit(5, 1_000));
        let b = backend.script_for(&limit(5, 1_000));
        backend.script_for(&limit(5, 2_000));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.script_count(), 2);
        assert_eq!(a.limit().max(), 5);
    }

    #[test]
    fn test_storage_key_prefix() {
        let backend = CacheBackend::new("redis://127.0.0.1:6379", "token", "wg").unwrap();
        assert_eq!(backend.storage_key("user:1"), "wg:user:1");

        let bare = CacheBackend::new("redis://127.0.0.1:6379", "token", "").unwrap();
        assert_eq!(bare.storage_key("user:1"), "user:1");
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = CacheBackend::new("not a url", "token", "wg");
        assert!(matches!(result, Err(WindowguardError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_store_propagates_failure() {
        // Nothing listens on port 1
        let backend = CacheBackend::new("redis://127.0.0.1:1", "token", "wg").unwrap();

        let err = backend.hit("k", &limit(1, 1_000), 0).await.unwrap_err();
        assert!(matches!(
            err,
            WindowguardError::BackendUnavailable { tier: Tier::Cache, .. }
        ));
    }

    #[tokio::test]
    async fn test_live_fixed_window() {
        let Some(backend) = live_backend() else {
            return;
        };
        let l = limit(5, 60_000);

        for _ in 0..5 {
            let counter = backend.hit("user:1", &l, 0).await.unwrap();
            assert!(counter.decide(&l, 0, Tier::Cache).allowed);
        }
        let counter = backend.hit("user:1", &l, 0).await.unwrap();
        let decision = counter.decide(&l, 0, Tier::Cache);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_live_window_restarts() {
        let Some(backend) = live_backend() else {
            return;
        };
        let l = limit(1, 100);

        backend.hit("k", &l, 0).await.unwrap();
        assert_eq!(backend.hit("k", &l, 0).await.unwrap().count, 2);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(backend.hit("k", &l, 0).await.unwrap().count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_concurrent_hits_admit_exactly_max() {
        let Some(backend) = live_backend() else {
            return;
        };
        let backend = Arc::new(backend);
        let l = limit(20, 60_000);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    let counter = backend.hit("shared", &l, 0).await.unwrap();
                    counter.decide(&l, 0, Tier::Cache).allowed
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        assert!(results.into_iter().all(|r| r.unwrap()));
    }
}
