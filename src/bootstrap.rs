//! Builds a [`TieredLimiter`] from configuration.
//!
//! This is the only place that looks at configuration to decide which tiers
//! exist. It runs once at startup; the limiter itself never re-probes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::WindowguardConfig;
use crate::error::Result;
use crate::ratelimit::{
    CacheBackend, MemoryBackend, RelationalBackend, TieredLimiter, WindowLimit,
};

/// Construct the limiter and every configured tier.
///
/// Must be called inside a tokio runtime: the in-process sweeper is spawned here.
pub async fn build_limiter(config: &WindowguardConfig) -> Result<TieredLimiter> {
    let defaults = WindowLimit::from_millis(
        config.limiter.default_max,
        config.limiter.default_window_ms,
    )?;

    let mut builder = TieredLimiter::builder()
        .defaults(defaults)
        .failure_policy(config.limiter.failure_policy)
        .call_timeout(Duration::from_millis(config.limiter.call_timeout_ms));

    match config.cache.credentials() {
        Some((url, token)) => {
            let cache = CacheBackend::new(url, token, config.cache.key_prefix.clone())?;
            info!(prefix = %config.cache.key_prefix, "Cache tier enabled");
            builder = builder.cache(Arc::new(cache));
        }
        None => info!("Cache tier not configured"),
    }

    if let Some(relational) = build_relational(config).await? {
        builder = builder.relational(Arc::new(relational));
    }

    if config.limiter.in_process_fallback {
        let memory = MemoryBackend::new();
        memory.start_sweeper(Duration::from_secs(config.limiter.sweep_interval_secs.max(1)));
        builder = builder.in_process(Arc::new(memory));
    }

    let limiter = builder.build();
    info!(
        tiers = ?limiter.configured_tiers(),
        failure_policy = ?limiter.failure_policy(),
        "Rate limiter initialized"
    );
    Ok(limiter)
}

/// Construct the relational tier, if a URL is configured.
///
/// A failed migration is logged and the tier is kept: the database may come
/// back later, and until it does its calls fall through like any other failure.
pub async fn build_relational(config: &WindowguardConfig) -> Result<Option<RelationalBackend>> {
    let Some(url) = config.relational.url.as_deref() else {
        info!("Relational tier not configured");
        return Ok(None);
    };

    let backend = RelationalBackend::connect_lazy(&config.relational, url)?;
    if config.relational.auto_migrate {
        if let Err(e) = backend.migrate().await {
            warn!(error = %e, "Relational migration failed; tier will be retried per call");
        }
    }
    info!("Relational tier enabled");
    Ok(Some(backend))
}

/// Delete relational rows whose window ended at or before `now_ms`.
///
/// Returns `None` when no relational tier is configured.
pub async fn purge_relational(config: &WindowguardConfig, now_ms: i64) -> Result<Option<u64>> {
    let Some(backend) = build_relational(config).await? else {
        return Ok(None);
    };
    let purged = backend.purge_expired(now_ms).await?;
    info!(purged, "Purged expired relational counters");
    Ok(Some(purged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Clock, FailurePolicy, SystemClock, Tier};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_config_is_in_process_only() {
        let limiter = build_limiter(&WindowguardConfig::default()).await.unwrap();
        assert_eq!(limiter.configured_tiers(), vec![Tier::InProcess]);
        assert_eq!(limiter.failure_policy(), FailurePolicy::Open);

        let decision = limiter.check_default("k").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(9));
    }

    #[tokio::test]
    async fn test_all_tiers_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = WindowguardConfig::default();
        config.cache.url = Some("redis://127.0.0.1:1".to_string());
        config.cache.token = Some("secret".to_string());
        config.relational.url = Some(format!(
            "sqlite://{}",
            dir.path().join("limits.db").display()
        ));

        let limiter = build_limiter(&config).await.unwrap();
        assert_eq!(
            limiter.configured_tiers(),
            vec![Tier::Cache, Tier::Relational, Tier::InProcess]
        );

        // Nothing listens on the cache port, so the relational tier answers
        let decision = limiter.check_limit("k", 1, 60_000).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.tier, Some(Tier::Relational));
    }

    #[tokio::test]
    async fn test_cache_without_token_is_skipped() {
        let mut config = WindowguardConfig::default();
        config.cache.url = Some("redis://127.0.0.1:6379".to_string());
        config.limiter.in_process_fallback = false;

        let limiter = build_limiter(&config).await.unwrap();
        assert!(limiter.configured_tiers().is_empty());
        // No tier at all: the failure policy decides
        let decision = limiter.check_limit("k", 1, 60_000).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.tier, None);
    }

    #[tokio::test]
    async fn test_purge_relational_removes_only_ended_windows() {
        let dir = TempDir::new().unwrap();
        let mut config = WindowguardConfig::default();
        config.relational.url = Some(format!(
            "sqlite://{}",
            dir.path().join("limits.db").display()
        ));
        config.limiter.in_process_fallback = false;

        let limiter = build_limiter(&config).await.unwrap();
        limiter.check_limit("short", 1, 1).await.unwrap();
        limiter.check_limit("long", 1, 3_600_000).await.unwrap();

        let later = SystemClock.now_ms() + 1_000;
        assert_eq!(purge_relational(&config, later).await.unwrap(), Some(1));
        assert_eq!(purge_relational(&config, later).await.unwrap(), Some(0));

        let relational = build_relational(&config).await.unwrap().unwrap();
        assert!(relational.get("short").await.unwrap().is_none());
        assert!(relational.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_without_relational_tier() {
        let config = WindowguardConfig::default();
        assert_eq!(purge_relational(&config, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_default_limit_is_rejected() {
        let mut config = WindowguardConfig::default();
        config.limiter.default_max = 0;
        assert!(build_limiter(&config).await.is_err());
    }
}
